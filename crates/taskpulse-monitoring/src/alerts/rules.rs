//! Built-in alert rules registered at startup.

use taskpulse_shared::types::{
    AlertRule, AlertSeverity, ChannelKind, CompareOp, EscalationPolicy,
};

fn rule(
    id: &str,
    name: &str,
    description: &str,
    category: &str,
    metric: &str,
    condition: CompareOp,
    threshold: f64,
    severity: AlertSeverity,
    window_minutes: u64,
    min_occurrences: usize,
    channels: Vec<ChannelKind>,
) -> AlertRule {
    AlertRule {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        category: category.into(),
        metric_name: metric.into(),
        condition,
        threshold,
        severity,
        evaluation_window_minutes: window_minutes,
        min_occurrences,
        enabled: true,
        notification_channels: channels,
        suppression_duration_minutes: 60,
        escalation: None,
    }
}

/// Default rule set covering the store, the application, and the host
pub fn built_in_rules() -> Vec<AlertRule> {
    let mut rules = vec![
        rule(
            "store_memory_critical",
            "Store Memory Critical",
            "Store memory usage is critically high",
            "store",
            "store_memory_used_percent",
            CompareOp::Gt,
            0.95,
            AlertSeverity::Critical,
            5,
            2,
            vec![ChannelKind::Log, ChannelKind::Email],
        ),
        rule(
            "store_memory_warning",
            "Store Memory Warning",
            "Store memory usage is high",
            "store",
            "store_memory_used_percent",
            CompareOp::Gt,
            0.85,
            AlertSeverity::High,
            5,
            3,
            vec![ChannelKind::Log],
        ),
        rule(
            "store_hit_rate_low",
            "Store Hit Rate Low",
            "Store hit rate is below acceptable threshold",
            "store",
            "store_hit_rate",
            CompareOp::Lt,
            0.85,
            AlertSeverity::Medium,
            10,
            5,
            vec![ChannelKind::Log],
        ),
        rule(
            "store_latency_high",
            "Store Latency High",
            "Store response latency is high",
            "store",
            "store_latency_ms",
            CompareOp::Gt,
            100.0,
            AlertSeverity::High,
            5,
            3,
            vec![ChannelKind::Log],
        ),
        rule(
            "error_rate_high",
            "Error Rate High",
            "System error rate is elevated",
            "application",
            "error_rate",
            CompareOp::Gt,
            0.05,
            AlertSeverity::High,
            5,
            3,
            vec![ChannelKind::Log, ChannelKind::Email],
        ),
        rule(
            "websocket_latency_slow",
            "WebSocket Latency Slow",
            "Realtime frame delivery is slow",
            "application",
            "websocket_latency",
            CompareOp::Gt,
            200.0,
            AlertSeverity::Medium,
            5,
            5,
            vec![ChannelKind::Log],
        ),
        rule(
            "cpu_usage_high",
            "CPU Usage High",
            "System CPU usage is high",
            "system",
            "cpu_usage",
            CompareOp::Gt,
            90.0,
            AlertSeverity::High,
            5,
            5,
            vec![ChannelKind::Log],
        ),
        rule(
            "memory_usage_critical",
            "Memory Usage Critical",
            "System memory usage is critically high",
            "system",
            "memory_usage_percent",
            CompareOp::Gt,
            95.0,
            AlertSeverity::Critical,
            3,
            2,
            vec![ChannelKind::Log, ChannelKind::Email],
        ),
    ];

    // The critical store-memory rule escalates to slack after half an hour
    rules[0].escalation = Some(EscalationPolicy {
        escalation_time_minutes: 30,
        increase_severity: false,
        notification_channels: vec![ChannelKind::Slack],
    });

    rules
}
