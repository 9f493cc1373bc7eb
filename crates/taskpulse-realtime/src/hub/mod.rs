//! # Fan-out Hub
//!
//! Connection registry, per-task and per-channel subscription indices,
//! heartbeat, backpressure-safe broadcast, and the store-pub/sub event
//! pump that feeds it.

mod connection;
mod fanout;
mod registry;
mod stats;
mod subscriber;

pub use connection::{Mailbox, PushOutcome};
pub use fanout::{ConnectedHandle, FanoutHub};
pub use registry::ConnectionRegistry;
pub use stats::{HubStatistics, HubStatsSnapshot};
pub use subscriber::run_event_pump;
