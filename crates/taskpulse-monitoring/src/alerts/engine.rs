//! # Alert Engine
//!
//! Periodic rule evaluation with suppression, escalation, and maintenance
//! sweeps. Rule and alert state persist to the store (`alert_rules:<id>`,
//! `active_alerts:<id>`, per-day `alert_history:<date>` lists) and are
//! reloaded on start, so a restart does not lose active alerts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use taskpulse_shared::config::AlertEngineConfig;
use taskpulse_shared::error::PulseResult;
use taskpulse_shared::metrics::MetricRegistry;
use taskpulse_shared::store::{
    active_alert_key, alert_history_key, alert_rule_key, metric_series_key, StoreGateway,
};
use taskpulse_shared::types::{Alert, AlertRule, AlertStatus, MetricPoint};

use super::notify::Notifier;
use super::rules::built_in_rules;

const RULE_TTL: Duration = Duration::from_secs(30 * 24 * 3_600);
const ACTIVE_ALERT_TTL: Duration = Duration::from_secs(24 * 3_600);
const HISTORY_TTL: Duration = Duration::from_secs(30 * 24 * 3_600);
const HISTORY_TRIM: i64 = 1_000;

/// Result of an acknowledge call; the second acknowledge is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    AlreadyAcknowledged,
    NotFound,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct AlertStatsSnapshot {
    pub total_created: u64,
    pub total_resolved: u64,
    pub total_notifications: u64,
    pub active_count: usize,
    pub avg_resolution_minutes: f64,
}

/// What an escalation will do, captured while the state lock is held
#[derive(Debug, Clone)]
struct EscalationPlan {
    increase_severity: bool,
    channels: Vec<taskpulse_shared::types::ChannelKind>,
}

#[derive(Debug, Default)]
struct AlertState {
    rules: HashMap<String, AlertRule>,
    active: HashMap<String, Alert>,
    /// Uniqueness index: one active alert per (rule, metric)
    active_by_pair: HashMap<(String, String), String>,
    history: VecDeque<Alert>,
    /// Suppressed (rule, metric) pairs with their expiry
    suppressions: HashMap<(String, String), DateTime<Utc>>,
    resolution_minutes: Vec<f64>,
}

/// Rule-driven alert lifecycle owner
#[derive(Debug)]
pub struct AlertEngine {
    gateway: StoreGateway,
    registry: Arc<MetricRegistry>,
    notifier: Notifier,
    config: AlertEngineConfig,
    state: tokio::sync::Mutex<AlertState>,
    created: AtomicU64,
    resolved: AtomicU64,
}

impl AlertEngine {
    pub fn new(
        gateway: StoreGateway,
        registry: Arc<MetricRegistry>,
        notifier: Notifier,
        config: AlertEngineConfig,
    ) -> Self {
        Self {
            gateway,
            registry,
            notifier,
            config,
            state: tokio::sync::Mutex::new(AlertState::default()),
            created: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
        }
    }

    /// Reload persisted rules and active alerts, then install the built-in
    /// rule set for ids not already present.
    pub async fn initialize(&self) -> PulseResult<()> {
        let mut loaded_rules = 0usize;
        let mut loaded_alerts = 0usize;
        {
            let mut state = self.state.lock().await;

            for key in self.gateway.scan("alert_rules:*").await? {
                if let Some(data) = self.gateway.get(&key).await? {
                    match serde_json::from_str::<AlertRule>(&data) {
                        Ok(rule) => {
                            state.rules.insert(rule.id.clone(), rule);
                            loaded_rules += 1;
                        }
                        Err(e) => warn!(key, error = %e, "skipping undecodable alert rule"),
                    }
                }
            }
            for key in self.gateway.scan("active_alerts:*").await? {
                if let Some(data) = self.gateway.get(&key).await? {
                    match serde_json::from_str::<Alert>(&data) {
                        Ok(alert) => {
                            state.active_by_pair.insert(pair_of(&alert), alert.id.clone());
                            state.active.insert(alert.id.clone(), alert);
                            loaded_alerts += 1;
                        }
                        Err(e) => warn!(key, error = %e, "skipping undecodable active alert"),
                    }
                }
            }
        }

        for rule in built_in_rules() {
            self.add_rule_if_absent(rule).await?;
        }
        info!(loaded_rules, loaded_alerts, "alert engine initialized");
        Ok(())
    }

    // =========================================================================
    // Rule registry
    // =========================================================================

    pub async fn add_rule(&self, rule: AlertRule) -> PulseResult<()> {
        let payload = serde_json::to_string(&rule)?;
        self.gateway
            .set(&alert_rule_key(&rule.id), &payload, Some(RULE_TTL))
            .await?;
        let mut state = self.state.lock().await;
        info!(rule = %rule.id, "alert rule registered");
        state.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn add_rule_if_absent(&self, rule: AlertRule) -> PulseResult<()> {
        {
            let state = self.state.lock().await;
            if state.rules.contains_key(&rule.id) {
                return Ok(());
            }
        }
        self.add_rule(rule).await
    }

    pub async fn remove_rule(&self, rule_id: &str) -> PulseResult<bool> {
        self.gateway.delete(&alert_rule_key(rule_id)).await?;
        let mut state = self.state.lock().await;
        Ok(state.rules.remove(rule_id).is_some())
    }

    pub async fn rule_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.rules.keys().cloned().collect()
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// One evaluation pass over every enabled rule.
    pub async fn evaluate_all(&self) {
        let rules: Vec<AlertRule> = {
            let state = self.state.lock().await;
            state.rules.values().filter(|r| r.enabled).cloned().collect()
        };
        for rule in rules {
            if let Err(e) = self.evaluate_rule(&rule).await {
                error!(rule = %rule.id, error = %e, "rule evaluation failed");
            }
        }
    }

    async fn evaluate_rule(&self, rule: &AlertRule) -> PulseResult<()> {
        let points = self.metric_window(rule).await;
        let triggered = is_triggered(rule, &points);
        let latest = points.last().map(|p| p.value);

        let existing_id = {
            let state = self.state.lock().await;
            state
                .active_by_pair
                .get(&(rule.id.clone(), rule.metric_name.clone()))
                .cloned()
        };

        match (triggered, existing_id) {
            (true, Some(alert_id)) => {
                let updated = {
                    let mut state = self.state.lock().await;
                    state.active.get_mut(&alert_id).map(|alert| {
                        alert.last_occurrence = Utc::now();
                        alert.occurrence_count += 1;
                        if let Some(value) = latest {
                            alert.value = value;
                        }
                        alert.clone()
                    })
                };
                if let Some(alert) = updated {
                    self.persist_active(&alert).await;
                }
            }
            (true, None) => {
                if let Some(value) = latest {
                    self.create_alert(rule, value).await?;
                }
            }
            (false, Some(alert_id)) => {
                self.resolve_alert(&alert_id, "Condition no longer met").await;
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// Window points for a rule: the in-memory registry first, the persisted
    /// series list as fallback for points recorded by another process.
    async fn metric_window(&self, rule: &AlertRule) -> Vec<MetricPoint> {
        let window_secs = rule.evaluation_window_minutes as f64 * 60.0;
        let points = self.registry.window_points(&rule.metric_name, window_secs);
        if !points.is_empty() {
            return points;
        }

        let key = metric_series_key(&rule.metric_name);
        let raw = match self.gateway.list_range(&key, 0, HISTORY_TRIM - 1).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(metric = %rule.metric_name, error = %e, "store fallback read failed");
                return Vec::new();
            }
        };
        let cutoff = Utc::now().timestamp_millis() as f64 / 1_000.0 - window_secs;
        let mut points: Vec<MetricPoint> = raw
            .iter()
            .filter_map(|entry| serde_json::from_str::<MetricPoint>(entry).ok())
            .filter(|p| p.timestamp >= cutoff)
            .collect();
        // List head is newest; evaluation wants oldest first
        points.reverse();
        points
    }

    async fn create_alert(&self, rule: &AlertRule, value: f64) -> PulseResult<()> {
        let now = Utc::now();
        let suppressed = {
            let state = self.state.lock().await;
            state
                .suppressions
                .get(&(rule.id.clone(), rule.metric_name.clone()))
                .is_some_and(|expiry| *expiry > now)
        };

        let alert = Alert {
            id: format!("{}_{}_{}", rule.id, rule.metric_name, now.timestamp()),
            rule_id: rule.id.clone(),
            title: rule.name.clone(),
            description: format!(
                "{} (current: {value}, threshold: {})",
                rule.description, rule.threshold
            ),
            severity: rule.severity,
            status: if suppressed {
                AlertStatus::Suppressed
            } else {
                AlertStatus::Active
            },
            value,
            threshold: rule.threshold,
            first_occurrence: now,
            last_occurrence: now,
            occurrence_count: 1,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            escalated: false,
            escalated_at: None,
            metadata: BTreeMap::from([
                ("rule_category".to_string(), json!(rule.category)),
                ("metric_name".to_string(), json!(rule.metric_name)),
                ("condition".to_string(), json!(rule.condition)),
                (
                    "evaluation_window_minutes".to_string(),
                    json!(rule.evaluation_window_minutes),
                ),
            ]),
        };

        {
            let mut state = self.state.lock().await;
            state.active_by_pair.insert(pair_of(&alert), alert.id.clone());
            state.active.insert(alert.id.clone(), alert.clone());
            push_history(&mut state.history, alert.clone(), self.config.history_capacity);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        self.persist_active(&alert).await;
        self.append_history(&alert).await;

        if suppressed {
            info!(alert = %alert.id, "alert suppressed");
        } else {
            self.notifier.dispatch(&alert, &rule.notification_channels).await;
            warn!(
                alert = %alert.id,
                severity = alert.severity.as_str(),
                value,
                threshold = rule.threshold,
                "alert created"
            );
        }
        Ok(())
    }

    /// Resolve an active alert. Resolution is terminal.
    pub async fn resolve_alert(&self, alert_id: &str, reason: &str) {
        let resolved = {
            let mut state = self.state.lock().await;
            let Some(mut alert) = state.active.remove(alert_id) else {
                return;
            };
            state.active_by_pair.remove(&pair_of(&alert));
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(Utc::now());
            alert
                .metadata
                .insert("resolution_reason".to_string(), json!(reason));
            let minutes = alert.duration_minutes(Utc::now());
            state.resolution_minutes.push(minutes);
            push_history(&mut state.history, alert.clone(), self.config.history_capacity);
            alert
        };
        self.resolved.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.gateway.delete(&active_alert_key(alert_id)).await {
            warn!(alert = alert_id, error = %e, "failed to clear persisted active alert");
        }
        self.append_history(&resolved).await;
        info!(alert = alert_id, reason, "alert resolved");
    }

    // =========================================================================
    // Acknowledge / suppress
    // =========================================================================

    pub async fn acknowledge(&self, alert_id: &str, acknowledged_by: &str) -> AckOutcome {
        let (outcome, snapshot) = {
            let mut state = self.state.lock().await;
            match state.active.get_mut(alert_id) {
                None => (AckOutcome::NotFound, None),
                Some(alert) if alert.acknowledged_at.is_some() => {
                    (AckOutcome::AlreadyAcknowledged, None)
                }
                Some(alert) => {
                    alert.status = AlertStatus::Acknowledged;
                    alert.acknowledged_by = Some(acknowledged_by.to_string());
                    alert.acknowledged_at = Some(Utc::now());
                    (AckOutcome::Acknowledged, Some(alert.clone()))
                }
            }
        };
        if let Some(alert) = snapshot {
            self.persist_active(&alert).await;
            info!(alert = alert_id, by = acknowledged_by, "alert acknowledged");
        }
        outcome
    }

    /// Silence new alerts for (rule, metric) for `duration_minutes`.
    pub async fn suppress(&self, rule_id: &str, metric_name: &str, duration_minutes: u64) {
        let expiry = Utc::now() + chrono::Duration::minutes(duration_minutes as i64);
        let mut state = self.state.lock().await;
        state
            .suppressions
            .insert((rule_id.to_string(), metric_name.to_string()), expiry);
        info!(rule = rule_id, metric = metric_name, duration_minutes, "alerts suppressed");
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Escalate active, non-escalated alerts older than their rule's policy.
    pub async fn escalation_sweep(&self) {
        let now = Utc::now();
        let candidates: Vec<(Alert, EscalationPlan)> = {
            let state = self.state.lock().await;
            state
                .active
                .values()
                .filter(|a| a.status == AlertStatus::Active && !a.escalated)
                .filter_map(|a| {
                    let rule = state.rules.get(&a.rule_id)?;
                    let policy = rule.escalation.as_ref()?;
                    (a.age_minutes(now) >= policy.escalation_time_minutes as f64).then(|| {
                        (
                            a.clone(),
                            EscalationPlan {
                                increase_severity: policy.increase_severity,
                                channels: policy.notification_channels.clone(),
                            },
                        )
                    })
                })
                .collect()
        };

        for (alert, policy) in candidates {
            let escalated = {
                let mut state = self.state.lock().await;
                state.active.get_mut(&alert.id).map(|a| {
                    a.escalated = true;
                    a.escalated_at = Some(now);
                    if policy.increase_severity {
                        a.severity = a.severity.escalated();
                    }
                    a.clone()
                })
            };
            if let Some(alert) = escalated {
                self.persist_active(&alert).await;
                self.notifier.dispatch(&alert, &policy.channels).await;
                warn!(
                    alert = %alert.id,
                    age_minutes = alert.age_minutes(now),
                    "alert escalated"
                );
            }
        }
    }

    /// Maintenance: auto-resolve stale actives, clear expired suppressions,
    /// trim the history deque by count and age.
    pub async fn maintenance_sweep(&self) {
        let now = Utc::now();
        let stale_cutoff = now - chrono::Duration::hours(self.config.stale_alert_hours);
        let stale: Vec<String> = {
            let state = self.state.lock().await;
            state
                .active
                .values()
                .filter(|a| a.status == AlertStatus::Active && a.first_occurrence < stale_cutoff)
                .map(|a| a.id.clone())
                .collect()
        };
        for alert_id in stale {
            self.resolve_alert(&alert_id, "Auto-resolved (stale alert)").await;
        }

        let mut state = self.state.lock().await;
        let before = state.suppressions.len();
        state.suppressions.retain(|_, expiry| *expiry > now);
        let cleared = before - state.suppressions.len();
        if cleared > 0 {
            info!(cleared, "expired alert suppressions cleared");
        }

        let retention = now - chrono::Duration::days(self.config.history_retention_days);
        state.history.retain(|a| a.first_occurrence > retention);
        while state.history.len() > self.config.history_capacity {
            state.history.pop_front();
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Active alerts, most severe first, optionally filtered by severity.
    pub async fn active_alerts(
        &self,
        limit: usize,
        severity: Option<taskpulse_shared::types::AlertSeverity>,
    ) -> Vec<Alert> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .active
            .values()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.first_occurrence.cmp(&a.first_occurrence)));
        alerts.truncate(limit);
        alerts
    }

    pub async fn stats(&self) -> AlertStatsSnapshot {
        let state = self.state.lock().await;
        let avg = if state.resolution_minutes.is_empty() {
            0.0
        } else {
            state.resolution_minutes.iter().sum::<f64>() / state.resolution_minutes.len() as f64
        };
        AlertStatsSnapshot {
            total_created: self.created.load(Ordering::Relaxed),
            total_resolved: self.resolved.load(Ordering::Relaxed),
            total_notifications: self.notifier.sent_count(),
            active_count: state.active.len(),
            avg_resolution_minutes: avg,
        }
    }

    // =========================================================================
    // Persistence helpers
    // =========================================================================

    async fn persist_active(&self, alert: &Alert) {
        let payload = match serde_json::to_string(alert) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(alert = %alert.id, error = %e, "alert not serializable");
                return;
            }
        };
        if let Err(e) = self
            .gateway
            .set(&active_alert_key(&alert.id), &payload, Some(ACTIVE_ALERT_TTL))
            .await
        {
            warn!(alert = %alert.id, error = %e, "active alert persistence failed");
        }
    }

    async fn append_history(&self, alert: &Alert) {
        let key = alert_history_key(alert.first_occurrence);
        let payload = match serde_json::to_string(alert) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        if let Err(e) = self.gateway.list_push(&key, &payload).await {
            debug!(error = %e, "alert history append skipped");
            return;
        }
        let _ = self.gateway.list_trim(&key, 0, HISTORY_TRIM - 1).await;
        let _ = self.gateway.expire(&key, HISTORY_TTL).await;
    }
}

fn pair_of(alert: &Alert) -> (String, String) {
    let metric = alert
        .metadata
        .get("metric_name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    (alert.rule_id.clone(), metric)
}

fn push_history(history: &mut VecDeque<Alert>, alert: Alert, capacity: usize) {
    if history.len() >= capacity {
        history.pop_front();
    }
    history.push_back(alert);
}

/// A rule triggers when its `min_occurrences` most-recent points all satisfy
/// the condition; fewer points than that is never a trigger.
fn is_triggered(rule: &AlertRule, points: &[MetricPoint]) -> bool {
    if points.len() < rule.min_occurrences {
        return false;
    }
    points[points.len() - rule.min_occurrences..]
        .iter()
        .all(|p| rule.condition.matches(p.value, rule.threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskpulse_shared::types::CompareOp;

    fn rule(min_occurrences: usize) -> AlertRule {
        AlertRule {
            id: "r".into(),
            name: "r".into(),
            description: String::new(),
            category: "test".into(),
            metric_name: "m".into(),
            condition: CompareOp::Gt,
            threshold: 90.0,
            severity: taskpulse_shared::types::AlertSeverity::High,
            evaluation_window_minutes: 5,
            min_occurrences,
            enabled: true,
            notification_channels: vec![],
            suppression_duration_minutes: 60,
            escalation: None,
        }
    }

    fn points(values: &[f64]) -> Vec<MetricPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricPoint::new(i as f64, *v))
            .collect()
    }

    #[test]
    fn test_trigger_requires_min_consecutive_recent_points() {
        let r = rule(3);
        assert!(is_triggered(&r, &points(&[95.0, 96.0, 97.0])));
        // Older breach, recent recovery: not triggered
        assert!(!is_triggered(&r, &points(&[95.0, 96.0, 50.0])));
        // A non-matching point inside the recent window blocks the trigger
        assert!(!is_triggered(&r, &points(&[95.0, 50.0, 97.0])));
        // History before the window is not consulted
        assert!(is_triggered(&r, &points(&[10.0, 95.0, 96.0, 97.0])));
    }

    #[test]
    fn test_fewer_points_than_min_occurrences_not_triggered() {
        let r = rule(3);
        assert!(!is_triggered(&r, &points(&[95.0, 96.0])));
        assert!(!is_triggered(&r, &points(&[])));
    }
}
