//! # Notification Channels
//!
//! Pluggable delivery by channel identifier: `log`, `email`, `webhook`,
//! `slack`. Message bodies come from a typed substitution function over the
//! alert's fields; runtime values are never spliced through a format string,
//! which keeps webhook payloads injection-free. A failure in one channel
//! never aborts the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use taskpulse_shared::types::{Alert, AlertSeverity, ChannelKind};

const SUBJECT_TEMPLATE: &str = "[{severity}] {title}";
const BODY_TEMPLATE: &str =
    "{title}: {description} (value={value}, threshold={threshold}, occurrences={occurrence_count})";

/// Process-wide channel configuration
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub email_from: String,
    pub email_to: Vec<String>,
    pub webhook_urls: Vec<String>,
    pub webhook_timeout_secs: u64,
    pub slack_webhook_url: Option<String>,
    pub slack_channel: String,
    pub slack_username: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            email_from: "monitoring@taskpulse.local".into(),
            email_to: vec!["ops@taskpulse.local".into()],
            webhook_urls: Vec::new(),
            webhook_timeout_secs: 10,
            slack_webhook_url: None,
            slack_channel: "#monitoring".into(),
            slack_username: "taskpulse-monitor".into(),
        }
    }
}

/// Dispatcher over the configured channels
#[derive(Debug)]
pub struct Notifier {
    config: NotifierConfig,
    http: reqwest::Client,
    sent: AtomicU64,
}

impl Notifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            sent: AtomicU64::new(0),
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Send the alert through every listed channel; returns how many sends
    /// succeeded.
    pub async fn dispatch(&self, alert: &Alert, channels: &[ChannelKind]) -> usize {
        let mut delivered = 0;
        for channel in channels {
            match self.send(alert, *channel).await {
                Ok(()) => {
                    delivered += 1;
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(channel = ?channel, alert = %alert.id, error = %e, "notification failed")
                }
            }
        }
        delivered
    }

    async fn send(&self, alert: &Alert, channel: ChannelKind) -> Result<(), String> {
        let subject = render(SUBJECT_TEMPLATE, alert);
        let body = render(BODY_TEMPLATE, alert);

        match channel {
            ChannelKind::Log => {
                warn!(
                    alert_id = %alert.id,
                    severity = alert.severity.as_str(),
                    value = alert.value,
                    threshold = alert.threshold,
                    "{subject}: {body}"
                );
                Ok(())
            }
            ChannelKind::Email => {
                // Delivery is delegated to the mail relay collaborator; the
                // core records the rendered message.
                info!(
                    from = %self.config.email_from,
                    to = ?self.config.email_to,
                    subject = %subject,
                    "email notification queued"
                );
                Ok(())
            }
            ChannelKind::Webhook => self.send_webhook(alert, &subject, &body).await,
            ChannelKind::Slack => self.send_slack(alert, &subject, &body).await,
        }
    }

    async fn send_webhook(&self, alert: &Alert, subject: &str, body: &str) -> Result<(), String> {
        if self.config.webhook_urls.is_empty() {
            return Ok(());
        }
        let payload = json!({
            "alert_id": alert.id,
            "title": subject,
            "description": body,
            "severity": alert.severity.as_str(),
            "status": alert.status,
            "timestamp": alert.last_occurrence,
            "value": alert.value,
            "threshold": alert.threshold,
        });
        let timeout = Duration::from_secs(self.config.webhook_timeout_secs);
        let mut last_error = None;
        for url in &self.config.webhook_urls {
            let result = self
                .http
                .post(url)
                .json(&payload)
                .timeout(timeout)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => last_error = Some(format!("{url}: status {}", response.status())),
                Err(e) => last_error = Some(format!("{url}: {e}")),
            }
        }
        match last_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn send_slack(&self, alert: &Alert, subject: &str, body: &str) -> Result<(), String> {
        let Some(url) = &self.config.slack_webhook_url else {
            return Ok(());
        };
        let payload = json!({
            "channel": self.config.slack_channel,
            "username": self.config.slack_username,
            "attachments": [{
                "color": severity_color(alert.severity),
                "title": subject,
                "text": body,
                "fields": [
                    {"title": "Value", "value": alert.value.to_string(), "short": true},
                    {"title": "Threshold", "value": alert.threshold.to_string(), "short": true},
                    {"title": "Occurrences", "value": alert.occurrence_count.to_string(), "short": true},
                ],
            }],
        });
        let response = self
            .http
            .post(url)
            .json(&payload)
            .timeout(Duration::from_secs(self.config.webhook_timeout_secs))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("slack returned status {}", response.status()))
        }
    }
}

fn severity_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Low => "#36a64f",
        AlertSeverity::Medium => "#ff9900",
        AlertSeverity::High => "#ff4444",
        AlertSeverity::Critical => "#990000",
    }
}

/// Typed template substitution in a single pass: only the named alert
/// fields are replaced, anything else passes through verbatim, and
/// substituted content is never re-scanned for placeholders.
fn render(template: &str, alert: &Alert) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find('}') {
            Some(end) => {
                match field_value(&tail[1..end], alert) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn field_value(name: &str, alert: &Alert) -> Option<String> {
    Some(match name {
        "title" => alert.title.clone(),
        "description" => alert.description.clone(),
        "severity" => alert.severity.as_str().to_string(),
        "value" => format_number(alert.value),
        "threshold" => format_number(alert.threshold),
        "occurrence_count" => alert.occurrence_count.to_string(),
        "timestamp" => alert.last_occurrence.to_rfc3339(),
        _ => return None,
    })
}

fn format_number(value: f64) -> String {
    if (value.fract()).abs() < 1e-9 {
        format!("{value:.0}")
    } else {
        format!("{value:.3}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use taskpulse_shared::types::AlertStatus;

    fn alert() -> Alert {
        Alert {
            id: "r1_cpu_1".into(),
            rule_id: "r1".into(),
            title: "CPU Usage High".into(),
            description: "System CPU usage is high".into(),
            severity: AlertSeverity::High,
            status: AlertStatus::Active,
            value: 95.5,
            threshold: 90.0,
            first_occurrence: Utc::now(),
            last_occurrence: Utc::now(),
            occurrence_count: 3,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            escalated: false,
            escalated_at: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_render_substitutes_known_fields() {
        let rendered = render(BODY_TEMPLATE, &alert());
        assert!(rendered.contains("CPU Usage High"));
        assert!(rendered.contains("value=95.500"));
        assert!(rendered.contains("threshold=90"));
        assert!(rendered.contains("occurrences=3"));
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let rendered = render("{title} {not_a_field}", &alert());
        assert!(rendered.contains("{not_a_field}"));
    }

    #[test]
    fn test_field_content_is_not_reinterpreted() {
        // A field value containing a placeholder stays literal
        let mut a = alert();
        a.title = "{value}".into();
        let rendered = render("{title}", &a);
        assert_eq!(rendered, "{value}");
    }

    #[tokio::test]
    async fn test_dispatch_isolates_channel_failures() {
        // A webhook pointing nowhere fails, the log channel still delivers
        let notifier = Notifier::new(NotifierConfig {
            webhook_urls: vec!["http://127.0.0.1:1/unreachable".into()],
            webhook_timeout_secs: 1,
            ..NotifierConfig::default()
        });
        let delivered = notifier
            .dispatch(&alert(), &[ChannelKind::Webhook, ChannelKind::Log])
            .await;
        assert_eq!(delivered, 1);
    }
}
