//! Integration tests for the alert engine against the in-memory store.

use std::sync::Arc;

use taskpulse_monitoring::alerts::{AckOutcome, AlertEngine, Notifier, NotifierConfig};
use taskpulse_shared::config::{AlertEngineConfig, MetricsConfig};
use taskpulse_shared::metrics::MetricRegistry;
use taskpulse_shared::store::{active_alert_key, StoreGateway};
use taskpulse_shared::types::{
    AlertRule, AlertSeverity, AlertStatus, ChannelKind, CompareOp, EscalationPolicy,
};

fn cpu_rule() -> AlertRule {
    AlertRule {
        id: "cpu_high_test".into(),
        name: "CPU High".into(),
        description: "CPU usage above threshold".into(),
        category: "system".into(),
        metric_name: "cpu_usage_percent".into(),
        condition: CompareOp::Gt,
        threshold: 90.0,
        severity: AlertSeverity::High,
        evaluation_window_minutes: 5,
        min_occurrences: 3,
        enabled: true,
        notification_channels: vec![ChannelKind::Log],
        suppression_duration_minutes: 60,
        escalation: None,
    }
}

async fn harness() -> (Arc<AlertEngine>, Arc<MetricRegistry>, StoreGateway) {
    let gateway = StoreGateway::in_memory();
    let registry = Arc::new(MetricRegistry::new(&MetricsConfig::default()));
    let engine = Arc::new(AlertEngine::new(
        gateway.clone(),
        registry.clone(),
        Notifier::new(NotifierConfig::default()),
        AlertEngineConfig::default(),
    ));
    engine.initialize().await.unwrap();
    (engine, registry, gateway)
}

#[tokio::test]
async fn test_alert_fires_and_resolves() {
    let (engine, registry, gateway) = harness().await;
    engine.add_rule(cpu_rule()).await.unwrap();

    // Three consecutive breaches trigger the rule
    for value in [95.0, 96.0, 97.0] {
        registry.record("cpu_usage_percent", value, None).await;
    }
    engine.evaluate_all().await;

    let active = engine.active_alerts(10, None).await;
    let alert = active
        .iter()
        .find(|a| a.rule_id == "cpu_high_test")
        .expect("alert should be active");
    assert_eq!(alert.status, AlertStatus::Active);
    assert!((alert.value - 97.0).abs() < f64::EPSILON);
    assert!((alert.threshold - 90.0).abs() < f64::EPSILON);

    // Persisted while active
    assert!(gateway
        .get(&active_alert_key(&alert.id))
        .await
        .unwrap()
        .is_some());

    // Recovery resolves it automatically
    for value in [50.0, 50.0, 50.0] {
        registry.record("cpu_usage_percent", value, None).await;
    }
    engine.evaluate_all().await;

    let active = engine.active_alerts(10, None).await;
    assert!(active.iter().all(|a| a.rule_id != "cpu_high_test"));
    assert!(gateway
        .get(&active_alert_key(&alert.id))
        .await
        .unwrap()
        .is_none());

    let stats = engine.stats().await;
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_resolved, 1);
}

#[tokio::test]
async fn test_repeated_trigger_updates_existing_alert() {
    let (engine, registry, _gateway) = harness().await;
    engine.add_rule(cpu_rule()).await.unwrap();

    for value in [95.0, 96.0, 97.0] {
        registry.record("cpu_usage_percent", value, None).await;
    }
    engine.evaluate_all().await;
    registry.record("cpu_usage_percent", 99.0, None).await;
    engine.evaluate_all().await;

    let active = engine.active_alerts(10, None).await;
    let alert = active.iter().find(|a| a.rule_id == "cpu_high_test").unwrap();
    assert_eq!(alert.occurrence_count, 2);
    assert!((alert.value - 99.0).abs() < f64::EPSILON);

    // Still exactly one active alert for the (rule, metric) pair
    let matching = active
        .iter()
        .filter(|a| a.rule_id == "cpu_high_test")
        .count();
    assert_eq!(matching, 1);
    assert_eq!(engine.stats().await.total_created, 1);
}

#[tokio::test]
async fn test_fewer_points_than_min_occurrences_do_not_trigger() {
    let (engine, registry, _gateway) = harness().await;
    engine.add_rule(cpu_rule()).await.unwrap();

    registry.record("cpu_usage_percent", 99.0, None).await;
    registry.record("cpu_usage_percent", 99.0, None).await;
    engine.evaluate_all().await;

    assert!(engine
        .active_alerts(10, None)
        .await
        .iter()
        .all(|a| a.rule_id != "cpu_high_test"));
}

#[tokio::test]
async fn test_suppressed_alert_created_silently() {
    let (engine, registry, _gateway) = harness().await;
    engine.add_rule(cpu_rule()).await.unwrap();
    engine.suppress("cpu_high_test", "cpu_usage_percent", 60).await;

    for value in [95.0, 96.0, 97.0] {
        registry.record("cpu_usage_percent", value, None).await;
    }
    engine.evaluate_all().await;

    let active = engine.active_alerts(10, None).await;
    let alert = active.iter().find(|a| a.rule_id == "cpu_high_test").unwrap();
    assert_eq!(alert.status, AlertStatus::Suppressed);
}

#[tokio::test]
async fn test_acknowledge_is_idempotent() {
    let (engine, registry, _gateway) = harness().await;
    engine.add_rule(cpu_rule()).await.unwrap();

    for value in [95.0, 96.0, 97.0] {
        registry.record("cpu_usage_percent", value, None).await;
    }
    engine.evaluate_all().await;
    let alert_id = engine.active_alerts(10, None).await[0].id.clone();

    assert_eq!(
        engine.acknowledge(&alert_id, "ops").await,
        AckOutcome::Acknowledged
    );
    assert_eq!(
        engine.acknowledge(&alert_id, "ops").await,
        AckOutcome::AlreadyAcknowledged
    );
    assert_eq!(
        engine.acknowledge("missing", "ops").await,
        AckOutcome::NotFound
    );

    // Acknowledgement does not clear active state
    let active = engine.active_alerts(10, None).await;
    let alert = active.iter().find(|a| a.id == alert_id).unwrap();
    assert_eq!(alert.status, AlertStatus::Acknowledged);
    assert_eq!(alert.acknowledged_by.as_deref(), Some("ops"));
}

#[tokio::test]
async fn test_escalation_bumps_and_notifies() {
    let (engine, registry, _gateway) = harness().await;
    let mut rule = cpu_rule();
    rule.severity = AlertSeverity::Medium;
    rule.escalation = Some(EscalationPolicy {
        escalation_time_minutes: 0,
        increase_severity: true,
        notification_channels: vec![ChannelKind::Log],
    });
    engine.add_rule(rule).await.unwrap();

    for value in [95.0, 96.0, 97.0] {
        registry.record("cpu_usage_percent", value, None).await;
    }
    engine.evaluate_all().await;
    engine.escalation_sweep().await;

    let active = engine.active_alerts(10, None).await;
    let alert = active.iter().find(|a| a.rule_id == "cpu_high_test").unwrap();
    assert!(alert.escalated);
    assert!(alert.escalated_at.is_some());
    assert_eq!(alert.severity, AlertSeverity::High);

    // Second sweep leaves the already-escalated alert alone
    engine.escalation_sweep().await;
    let again = engine.active_alerts(10, None).await;
    let alert_again = again.iter().find(|a| a.rule_id == "cpu_high_test").unwrap();
    assert_eq!(alert_again.escalated_at, alert.escalated_at);
}

#[tokio::test]
async fn test_maintenance_resolves_stale_alerts() {
    let gateway = StoreGateway::in_memory();
    let registry = Arc::new(MetricRegistry::new(&MetricsConfig::default()));
    let engine = Arc::new(AlertEngine::new(
        gateway,
        registry.clone(),
        Notifier::new(NotifierConfig::default()),
        AlertEngineConfig {
            stale_alert_hours: 0,
            ..AlertEngineConfig::default()
        },
    ));
    engine.initialize().await.unwrap();
    engine.add_rule(cpu_rule()).await.unwrap();

    for value in [95.0, 96.0, 97.0] {
        registry.record("cpu_usage_percent", value, None).await;
    }
    engine.evaluate_all().await;
    assert_eq!(engine.active_alerts(10, None).await.len(), 1);

    engine.maintenance_sweep().await;
    assert!(engine.active_alerts(10, None).await.is_empty());
    assert_eq!(engine.stats().await.total_resolved, 1);
}

#[tokio::test]
async fn test_severity_filter_and_limit() {
    let (engine, registry, _gateway) = harness().await;
    let mut low = cpu_rule();
    low.id = "low_rule".into();
    low.metric_name = "aux_metric".into();
    low.severity = AlertSeverity::Low;
    low.min_occurrences = 1;
    engine.add_rule(low).await.unwrap();

    let mut high = cpu_rule();
    high.min_occurrences = 1;
    engine.add_rule(high).await.unwrap();

    registry.record("cpu_usage_percent", 95.0, None).await;
    registry.record("aux_metric", 95.0, None).await;
    engine.evaluate_all().await;

    let only_high = engine.active_alerts(10, Some(AlertSeverity::High)).await;
    assert_eq!(only_high.len(), 1);
    assert_eq!(only_high[0].rule_id, "cpu_high_test");

    let limited = engine.active_alerts(1, None).await;
    assert_eq!(limited.len(), 1);
    // Most severe first
    assert_eq!(limited[0].severity, AlertSeverity::High);
}

#[tokio::test]
async fn test_rules_reload_from_store() {
    let gateway = StoreGateway::in_memory();
    let registry = Arc::new(MetricRegistry::new(&MetricsConfig::default()));

    {
        let engine = AlertEngine::new(
            gateway.clone(),
            registry.clone(),
            Notifier::new(NotifierConfig::default()),
            AlertEngineConfig::default(),
        );
        engine.initialize().await.unwrap();
        engine.add_rule(cpu_rule()).await.unwrap();
    }

    // A fresh engine over the same store sees the persisted rule
    let engine = AlertEngine::new(
        gateway,
        registry,
        Notifier::new(NotifierConfig::default()),
        AlertEngineConfig::default(),
    );
    engine.initialize().await.unwrap();
    assert!(engine.rule_ids().await.contains(&"cpu_high_test".to_string()));
}
