//! # TaskPulse Monitoring
//!
//! The operational observability layer: a rule-based alert engine, a
//! system/application metrics collector, and a performance optimizer that
//! tunes the backing store in a closed loop.

pub mod alerts;
pub mod collector;
pub mod optimizer;

pub use alerts::{AckOutcome, AlertEngine, Notifier, NotifierConfig};
pub use collector::SystemCollector;
pub use optimizer::{OptimizerStatus, PerformanceOptimizer};
