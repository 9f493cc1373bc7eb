//! Persisted key layout.
//!
//! Single source of truth for every key the system writes, so the cleanup
//! sweep, the dashboard, and the engines never drift apart on naming.

use chrono::{DateTime, Utc};

/// Pub/sub channel carrying progress event JSON
pub const PROGRESS_CHANNEL: &str = "progress_updates";

/// Set of live task ids
pub const ACTIVE_TASKS_KEY: &str = "active_tasks";

/// Sorted set of terminal task ids scored by completion epoch
pub const COMPLETED_TASKS_KEY: &str = "completed_tasks";

pub const TASK_KEY_PREFIX: &str = "task:";
pub const EVENTS_KEY_PREFIX: &str = "events:";

/// Hash holding the serialized task record plus bookkeeping fields
pub fn task_key(task_id: &str) -> String {
    format!("{TASK_KEY_PREFIX}{task_id}")
}

/// List of timeline event JSON, head is newest
pub fn events_key(task_id: &str) -> String {
    format!("{EVENTS_KEY_PREFIX}{task_id}")
}

pub fn task_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(TASK_KEY_PREFIX)
}

/// List of point JSON per series, trimmed to capacity, 24 h TTL
pub fn metric_series_key(name: &str) -> String {
    format!("metrics:series:{name}")
}

/// JSON snapshot of all series heads, 24 h TTL
pub fn metrics_snapshot_key(epoch: i64) -> String {
    format!("metrics:snapshot:{epoch}")
}

/// Alert rule JSON, 30-day TTL
pub fn alert_rule_key(rule_id: &str) -> String {
    format!("alert_rules:{rule_id}")
}

/// Active alert JSON, 24 h TTL
pub fn active_alert_key(alert_id: &str) -> String {
    format!("active_alerts:{alert_id}")
}

/// Per-day alert history list, trimmed to 1000, 30-day TTL
pub fn alert_history_key(day: DateTime<Utc>) -> String {
    format!("alert_history:{}", day.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(task_key("abc"), "task:abc");
        assert_eq!(events_key("abc"), "events:abc");
        assert_eq!(metric_series_key("cpu_usage"), "metrics:series:cpu_usage");
        assert_eq!(alert_rule_key("memory_critical"), "alert_rules:memory_critical");
        assert_eq!(task_id_from_key("task:abc"), Some("abc"));
        assert_eq!(task_id_from_key("events:abc"), None);
    }
}
