//! # Alert Rules and Alert Instances
//!
//! A rule is a declarative predicate over a named metric; an alert is one
//! firing of that rule. An active alert is unique per (rule, metric) pair,
//! acknowledgement does not clear active state, and resolution is terminal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Float comparison tolerance for `==` / `!=` conditions
const EQ_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// One-step severity bump used by escalation
    pub fn escalated(&self) -> AlertSeverity {
        match self {
            AlertSeverity::Low => AlertSeverity::Medium,
            AlertSeverity::Medium => AlertSeverity::High,
            AlertSeverity::High | AlertSeverity::Critical => AlertSeverity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

/// Comparison operator referenced by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    pub fn matches(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Ge => value >= threshold,
            CompareOp::Le => value <= threshold,
            CompareOp::Eq => (value - threshold).abs() < EQ_EPSILON,
            CompareOp::Ne => (value - threshold).abs() >= EQ_EPSILON,
        }
    }
}

/// Notification channel identifiers; channel configuration is process-wide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Log,
    Email,
    Webhook,
    Slack,
}

/// How an aging active alert escalates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub escalation_time_minutes: u64,
    #[serde(default)]
    pub increase_severity: bool,
    #[serde(default)]
    pub notification_channels: Vec<ChannelKind>,
}

/// Declarative alert rule, persisted under `alert_rules:<id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Grouping tag: store, application, system, custom
    pub category: String,
    pub metric_name: String,
    pub condition: CompareOp,
    pub threshold: f64,
    pub severity: AlertSeverity,
    #[serde(default = "default_window_minutes")]
    pub evaluation_window_minutes: u64,
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notification_channels: Vec<ChannelKind>,
    #[serde(default = "default_suppression_minutes")]
    pub suppression_duration_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPolicy>,
}

fn default_window_minutes() -> u64 {
    5
}

fn default_min_occurrences() -> usize {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_suppression_minutes() -> u64 {
    60
}

/// One firing of a rule, persisted under `active_alerts:<id>` while active
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub title: String,
    pub description: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    /// Latest metric value that satisfied the condition
    pub value: f64,
    pub threshold: f64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub occurrence_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Alert {
    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.first_occurrence).num_seconds() as f64 / 60.0
    }

    pub fn duration_minutes(&self, now: DateTime<Utc>) -> f64 {
        let end = self.resolved_at.unwrap_or(now);
        (end - self.first_occurrence).num_seconds() as f64 / 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_ops() {
        assert!(CompareOp::Gt.matches(91.0, 90.0));
        assert!(!CompareOp::Gt.matches(90.0, 90.0));
        assert!(CompareOp::Ge.matches(90.0, 90.0));
        assert!(CompareOp::Lt.matches(0.5, 0.85));
        assert!(CompareOp::Le.matches(0.85, 0.85));
        assert!(CompareOp::Eq.matches(1.0, 1.0005));
        assert!(CompareOp::Ne.matches(1.0, 1.5));
    }

    #[test]
    fn test_operator_serde_symbols() {
        assert_eq!(serde_json::to_string(&CompareOp::Gt).unwrap(), "\">\"");
        assert_eq!(
            serde_json::from_str::<CompareOp>("\"<=\"").unwrap(),
            CompareOp::Le
        );
    }

    #[test]
    fn test_severity_escalation_saturates() {
        assert_eq!(AlertSeverity::Low.escalated(), AlertSeverity::Medium);
        assert_eq!(AlertSeverity::High.escalated(), AlertSeverity::Critical);
        assert_eq!(AlertSeverity::Critical.escalated(), AlertSeverity::Critical);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::High);
        assert!(AlertSeverity::Medium > AlertSeverity::Low);
    }
}
