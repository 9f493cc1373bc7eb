//! # Alert Engine
//!
//! Rule evaluation against metric series, alert lifecycle
//! (active/acknowledged/resolved/suppressed), escalation, suppression, and
//! pluggable notification channels.

mod engine;
mod notify;
mod rules;

pub use engine::{AckOutcome, AlertEngine, AlertStatsSnapshot};
pub use notify::{Notifier, NotifierConfig};
pub use rules::built_in_rules;
