//! Default optimization rules.

use std::collections::BTreeMap;

use serde_json::json;
use taskpulse_shared::types::{OptimizationRule, OptimizeActionKind, OptimizeCondition};

fn rule(
    id: &str,
    name: &str,
    description: &str,
    condition: OptimizeCondition,
    threshold: f64,
    action: OptimizeActionKind,
    parameters: BTreeMap<String, serde_json::Value>,
    cooldown_minutes: i64,
) -> OptimizationRule {
    OptimizationRule {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        condition,
        threshold,
        action,
        parameters,
        enabled: true,
        cooldown_minutes,
        last_applied: None,
    }
}

/// The built-in tuning rule set
pub fn default_optimization_rules() -> Vec<OptimizationRule> {
    vec![
        rule(
            "memory_high_adjust_policy",
            "Adjust Memory Policy for High Usage",
            "Changes the eviction policy when memory usage is high",
            OptimizeCondition::MemoryHigh,
            0.85,
            OptimizeActionKind::AdjustMaxmemoryPolicy,
            BTreeMap::from([("policy".to_string(), json!("allkeys-lru"))]),
            60,
        ),
        rule(
            "hit_rate_low_cleanup",
            "Memory Cleanup for Low Hit Rate",
            "Triggers a memory cleanup when the hit rate is low",
            OptimizeCondition::HitRateLow,
            0.80,
            OptimizeActionKind::TriggerMemoryCleanup,
            BTreeMap::from([("cleanup_type".to_string(), json!("expire_scan"))]),
            30,
        ),
        rule(
            "latency_high_timeout_adjust",
            "Adjust Timeout for High Latency",
            "Reduces the connection timeout when latency is high",
            OptimizeCondition::LatencyHigh,
            50.0,
            OptimizeActionKind::AdjustConnectionTimeout,
            BTreeMap::from([("timeout_seconds".to_string(), json!(180))]),
            45,
        ),
        rule(
            "connections_high_limit",
            "Raise Max Clients for High Connection Count",
            "Raises the client limit when the connection count runs high",
            OptimizeCondition::ConnectionsHigh,
            8_000.0,
            OptimizeActionKind::AdjustMaxclients,
            BTreeMap::from([("maxclients".to_string(), json!(12_000))]),
            90,
        ),
        rule(
            "fragmentation_high_cleanup",
            "Defragmentation for High Fragmentation",
            "Requests defragmentation when the fragmentation ratio is high",
            OptimizeCondition::FragmentationHigh,
            1.5,
            OptimizeActionKind::TriggerMemoryCleanup,
            BTreeMap::from([("cleanup_type".to_string(), json!("defrag"))]),
            120,
        ),
        rule(
            "memory_critical_compression",
            "Enable Compression for Critical Memory Usage",
            "Enables snapshot compression when memory usage is critical",
            OptimizeCondition::MemoryHigh,
            0.95,
            OptimizeActionKind::EnableCompression,
            BTreeMap::from([("rdb_compression".to_string(), json!("yes"))]),
            180,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_unique_and_enabled() {
        let rules = default_optimization_rules();
        assert_eq!(rules.len(), 6);
        let mut ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
        assert!(rules.iter().all(|r| r.enabled && r.cooldown_minutes > 0));
    }
}
