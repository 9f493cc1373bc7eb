//! Records for the closed-loop store optimizer: rules, samples, baseline,
//! and the audit trail of applied actions.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conditions a rule can watch on the sampled store metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeCondition {
    MemoryHigh,
    HitRateLow,
    LatencyHigh,
    ConnectionsHigh,
    FragmentationHigh,
    EvictionRateHigh,
}

/// Corrective actions the optimizer can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeActionKind {
    AdjustMaxmemoryPolicy,
    AdjustConnectionTimeout,
    AdjustMaxclients,
    TriggerMemoryCleanup,
    AdjustSavePolicy,
    EnableCompression,
}

impl OptimizeActionKind {
    /// Configuration actions that can be reverted to documented defaults.
    /// Cleanup and compression are one-way and never auto-rolled-back.
    pub fn is_rollback_safe(&self) -> bool {
        matches!(
            self,
            OptimizeActionKind::AdjustMaxmemoryPolicy
                | OptimizeActionKind::AdjustConnectionTimeout
                | OptimizeActionKind::AdjustMaxclients
                | OptimizeActionKind::AdjustSavePolicy
        )
    }
}

/// One tuning rule with a cooldown between applications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub condition: OptimizeCondition,
    pub threshold: f64,
    pub action: OptimizeActionKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> i64 {
    30
}

impl OptimizationRule {
    pub fn can_apply(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_applied {
            None => true,
            Some(applied) => now > applied + Duration::minutes(self.cooldown_minutes),
        }
    }
}

/// Point-in-time snapshot of the store metrics the optimizer watches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSample {
    pub memory_used_mb: f64,
    /// Fraction in [0, 1]; 0 when maxmemory is unset
    pub memory_used_percent: f64,
    pub hit_rate: f64,
    pub latency_ms: f64,
    pub connected_clients: u64,
    pub ops_per_sec: u64,
    pub evicted_keys: u64,
    pub fragmentation_ratio: f64,
    pub timestamp: DateTime<Utc>,
}

/// Mean of the startup samples, the reference for degradation detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub latency_ms: f64,
    pub hit_rate: f64,
    pub ops_per_sec: f64,
    pub memory_used_percent: f64,
    pub fragmentation_ratio: f64,
    pub established_at: DateTime<Utc>,
}

/// Audit record of one optimizer decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationAction {
    pub id: String,
    pub rule_id: String,
    pub action: OptimizeActionKind,
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_metrics: Option<StoreSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_metrics: Option<StoreSample>,
    /// Weighted improvement in [0, 100]
    pub impact_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_gates_application() {
        let now = Utc::now();
        let mut rule = OptimizationRule {
            id: "r1".into(),
            name: "test".into(),
            description: String::new(),
            condition: OptimizeCondition::MemoryHigh,
            threshold: 0.85,
            action: OptimizeActionKind::AdjustMaxmemoryPolicy,
            parameters: BTreeMap::new(),
            enabled: true,
            cooldown_minutes: 30,
            last_applied: None,
        };
        assert!(rule.can_apply(now));

        rule.last_applied = Some(now - Duration::minutes(10));
        assert!(!rule.can_apply(now));

        rule.last_applied = Some(now - Duration::minutes(31));
        assert!(rule.can_apply(now));

        rule.enabled = false;
        assert!(!rule.can_apply(now));
    }

    #[test]
    fn test_rollback_safe_set() {
        assert!(OptimizeActionKind::AdjustMaxmemoryPolicy.is_rollback_safe());
        assert!(OptimizeActionKind::AdjustSavePolicy.is_rollback_safe());
        assert!(!OptimizeActionKind::TriggerMemoryCleanup.is_rollback_safe());
        assert!(!OptimizeActionKind::EnableCompression.is_rollback_safe());
    }
}
