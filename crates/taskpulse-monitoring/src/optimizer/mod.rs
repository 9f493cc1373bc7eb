//! # Performance Optimizer
//!
//! Closed-loop controller over the store's configuration: samples key
//! metrics, applies rule-driven corrective actions inside safety envelopes,
//! scores their impact, and rolls back configuration changes when the
//! system degrades against its baseline.

mod actions;
mod engine;
mod rules;

pub use actions::{apply_action, ActionError};
pub use engine::{impact_score, OptimizerStatus, PerformanceOptimizer};
pub use rules::default_optimization_rules;
