//! Integration tests for the performance optimizer against the in-memory
//! store. The settle delay and baseline gap are zeroed so cycles complete
//! immediately.

use taskpulse_monitoring::optimizer::PerformanceOptimizer;
use taskpulse_shared::config::{OptimizerConfig, StoreConfig};
use taskpulse_shared::store::{StoreBackend, StoreGateway};
use taskpulse_shared::types::OptimizeActionKind;

fn fast_config() -> OptimizerConfig {
    OptimizerConfig {
        impact_delay_secs: 0,
        baseline_sample_gap_ms: 0,
        baseline_samples: 3,
        ..OptimizerConfig::default()
    }
}

fn gateway_with_info(fields: &[(&str, &str)]) -> StoreGateway {
    let backend = StoreBackend::new_in_memory();
    if let StoreBackend::InMemory(mem) = &backend {
        for (field, value) in fields {
            mem.set_info_field(field, value);
        }
    }
    StoreGateway::new(backend, StoreConfig::default())
}

#[tokio::test]
async fn test_memory_high_rule_applies_and_scores() {
    // 96% memory use trips both memory rules
    let gateway = gateway_with_info(&[("used_memory", "960"), ("maxmemory", "1000")]);
    let optimizer = PerformanceOptimizer::new(gateway.clone(), fast_config());

    optimizer.run_cycle().await;

    let status = optimizer.status().await;
    assert!(status.successful_optimizations >= 1);

    let action = status
        .recent_actions
        .iter()
        .find(|a| a.rule_id == "memory_high_adjust_policy")
        .expect("policy rule should have applied");
    assert!(action.success);
    let before = action.before_metrics.as_ref().unwrap();
    assert!((before.memory_used_percent - 0.96).abs() < 1e-9);
    assert!(action.after_metrics.is_some());
    assert!((0.0..=100.0).contains(&action.impact_score));

    assert_eq!(
        gateway
            .config_get("maxmemory-policy")
            .await
            .unwrap()
            .as_deref(),
        Some("allkeys-lru")
    );
}

#[tokio::test]
async fn test_cooldown_blocks_immediate_reapplication() {
    let gateway = gateway_with_info(&[("used_memory", "960"), ("maxmemory", "1000")]);
    let optimizer = PerformanceOptimizer::new(gateway, fast_config());

    optimizer.run_cycle().await;
    let first = optimizer.status().await.total_optimizations;
    assert!(first >= 1);

    optimizer.run_cycle().await;
    let second = optimizer.status().await.total_optimizations;
    assert_eq!(first, second, "cooldown should block re-application");
}

#[tokio::test]
async fn test_healthy_store_triggers_nothing() {
    // Defaults: no maxmemory limit, high hit rate, no fragmentation problem
    let gateway = gateway_with_info(&[]);
    let optimizer = PerformanceOptimizer::new(gateway, fast_config());

    optimizer.run_cycle().await;
    assert_eq!(optimizer.status().await.total_optimizations, 0);
}

#[tokio::test]
async fn test_baseline_establishment() {
    let gateway = gateway_with_info(&[("instantaneous_ops_per_sec", "200")]);
    let optimizer = PerformanceOptimizer::new(gateway, fast_config());

    optimizer.establish_baseline().await.unwrap();
    let status = optimizer.status().await;
    let baseline = status.baseline.unwrap();
    assert!((baseline.ops_per_sec - 200.0).abs() < 1e-9);
    assert!((baseline.hit_rate - (1000.0 / 1050.0)).abs() < 1e-6);
}

#[tokio::test]
async fn test_degradation_rolls_back_safe_actions() {
    let gateway = gateway_with_info(&[("instantaneous_ops_per_sec", "200")]);
    let optimizer = PerformanceOptimizer::new(gateway.clone(), fast_config());

    optimizer.establish_baseline().await.unwrap();

    // Operator applies the timeout tweak
    optimizer
        .manual_apply("latency_high_timeout_adjust")
        .await
        .unwrap();
    assert_eq!(
        gateway.config_get("timeout").await.unwrap().as_deref(),
        Some("180")
    );

    // Throughput collapses below half the baseline
    if let StoreBackend::InMemory(mem) = gateway.backend().as_ref() {
        mem.set_info_field("instantaneous_ops_per_sec", "10");
    }
    optimizer.sample().await.unwrap();
    optimizer.analyze().await;

    let status = optimizer.status().await;
    assert_eq!(status.rollbacks_performed, 1);
    assert_eq!(
        gateway.config_get("timeout").await.unwrap().as_deref(),
        Some("300")
    );
}

#[tokio::test]
async fn test_cleanup_actions_never_roll_back() {
    let gateway = gateway_with_info(&[("instantaneous_ops_per_sec", "200")]);
    let optimizer = PerformanceOptimizer::new(gateway.clone(), fast_config());
    optimizer.establish_baseline().await.unwrap();

    // A cleanup applied by hand, then degradation
    optimizer.manual_apply("hit_rate_low_cleanup").await.unwrap();
    if let StoreBackend::InMemory(mem) = gateway.backend().as_ref() {
        mem.set_info_field("instantaneous_ops_per_sec", "10");
    }
    optimizer.sample().await.unwrap();
    optimizer.analyze().await;

    assert_eq!(optimizer.status().await.rollbacks_performed, 0);
    let cleanup = optimizer
        .status()
        .await
        .recent_actions
        .iter()
        .find(|a| a.action == OptimizeActionKind::TriggerMemoryCleanup)
        .cloned()
        .unwrap();
    assert!(cleanup.success);
}

#[tokio::test]
async fn test_manual_apply_unknown_rule_is_not_found() {
    let gateway = gateway_with_info(&[]);
    let optimizer = PerformanceOptimizer::new(gateway, fast_config());
    assert!(optimizer.manual_apply("no_such_rule").await.is_err());
}
