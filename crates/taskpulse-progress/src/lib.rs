//! # TaskPulse Progress Engine
//!
//! Owns the lifecycle of every tracked task and is the sole writer of task,
//! stage, aggregate, and timeline records. Progress math is separated from
//! event publication: events go out on the store's pub/sub channel strictly
//! after the corresponding persistent write commits.

pub mod cleanup;
pub mod engine;
pub mod rates;
pub mod weights;

pub use cleanup::CleanupSweeper;
pub use engine::{ProgressEngine, ProgressStatistics, TaskStateReader};
