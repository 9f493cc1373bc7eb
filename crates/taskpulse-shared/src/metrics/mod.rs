//! # Metric Series Store
//!
//! Thread-safe collection of named series. A fixed registry of built-in
//! series is installed on construction; unknown names are created lazily on
//! first write with a kind inferred from the name. Each recorded point is
//! best-effort appended to the store for cross-process queries; in-memory
//! buffers start empty on boot.

mod series;

use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::config::MetricsConfig;
use crate::store::{metric_series_key, metrics_snapshot_key, StoreGateway};
use crate::types::{AggregateOp, MetricKind, MetricPoint};

pub use series::{HistoryBucket, MetricSeries, MetricSummary};

/// Descriptor for listings (`GET /metrics` and the dashboard)
#[derive(Debug, Clone, serde::Serialize)]
pub struct SeriesInfo {
    pub name: String,
    pub kind: MetricKind,
    pub unit: String,
    pub description: String,
    pub data_points: usize,
    pub latest_value: Option<f64>,
}

/// Thread-safe registry of metric series
#[derive(Debug)]
pub struct MetricRegistry {
    series: DashMap<String, MetricSeries>,
    capacity: usize,
    durability_ttl: std::time::Duration,
    gateway: Option<StoreGateway>,
}

impl MetricRegistry {
    pub fn new(config: &MetricsConfig) -> Self {
        let registry = Self {
            series: DashMap::new(),
            capacity: config.series_capacity,
            durability_ttl: std::time::Duration::from_secs(config.durability_ttl_secs),
            gateway: None,
        };
        registry.install_builtins();
        registry
    }

    /// Enable best-effort durability through the store gateway
    pub fn with_gateway(mut self, gateway: StoreGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    fn install_builtins(&self) {
        let builtins: [(&str, MetricKind, &str, &str); 10] = [
            ("websocket_latency", MetricKind::Latency, "ms", "WebSocket message latency"),
            ("sse_latency", MetricKind::Latency, "ms", "SSE event latency"),
            ("download_speed", MetricKind::Speed, "bytes/s", "Download speed"),
            ("active_connections", MetricKind::ConnectionCount, "count", "Active WebSocket connections"),
            ("active_tasks", MetricKind::ConnectionCount, "count", "Active progress tasks"),
            ("error_rate", MetricKind::ErrorRate, "percent", "System error rate"),
            ("stage_completion_time", MetricKind::StageDuration, "seconds", "Time to complete stages"),
            ("memory_usage", MetricKind::ResourceUsage, "MB", "Memory usage"),
            ("cpu_usage", MetricKind::ResourceUsage, "percent", "CPU usage"),
            ("store_ops_per_sec", MetricKind::Throughput, "ops/s", "Store operations per second"),
        ];
        for (name, kind, unit, description) in builtins {
            self.series.insert(
                name.to_string(),
                MetricSeries::new(name, kind, unit, description, self.capacity),
            );
        }
    }

    /// Record one point. Unknown series are created lazily; persistence is
    /// best effort and never fails the caller.
    pub async fn record(&self, name: &str, value: f64, labels: Option<BTreeMap<String, String>>) {
        self.record_at(name, value, labels, Utc::now().timestamp_millis() as f64 / 1_000.0)
            .await;
    }

    /// Record with an explicit epoch-seconds timestamp
    pub async fn record_at(
        &self,
        name: &str,
        value: f64,
        labels: Option<BTreeMap<String, String>>,
        timestamp: f64,
    ) {
        let point = MetricPoint {
            timestamp,
            value,
            labels: labels.unwrap_or_default(),
        };

        self.series
            .entry(name.to_string())
            .or_insert_with(|| {
                MetricSeries::new(
                    name,
                    classify_kind(name),
                    "",
                    format!("Series {name} (auto-created)"),
                    self.capacity,
                )
            })
            .record(point.clone());

        if let Some(gateway) = &self.gateway {
            let key = metric_series_key(name);
            let payload = match serde_json::to_string(&point) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(metric = name, error = %e, "metric point not serializable");
                    return;
                }
            };
            // Best effort: a store outage must not block metric recording
            if let Err(e) = gateway.list_push(&key, &payload).await {
                debug!(metric = name, error = %e, "metric persistence skipped");
                return;
            }
            let _ = gateway.list_trim(&key, 0, self.capacity as i64 - 1).await;
            let _ = gateway.expire(&key, self.durability_ttl).await;
        }
    }

    pub fn aggregate(&self, name: &str, op: AggregateOp, window_secs: Option<f64>) -> Option<f64> {
        let now = now_epoch();
        self.series.get(name)?.aggregate(op, window_secs, now)
    }

    pub fn summary(&self, name: &str, window_secs: Option<f64>) -> Option<MetricSummary> {
        let now = now_epoch();
        self.series.get(name)?.summary(window_secs, now)
    }

    pub fn all_summaries(&self, window_secs: Option<f64>) -> BTreeMap<String, MetricSummary> {
        let now = now_epoch();
        self.series
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .summary(window_secs, now)
                    .map(|s| (entry.key().clone(), s))
            })
            .collect()
    }

    pub fn history(
        &self,
        name: &str,
        window_secs: f64,
        resolution: usize,
    ) -> Option<Vec<HistoryBucket>> {
        let now = now_epoch();
        Some(self.series.get(name)?.history(window_secs, resolution, now))
    }

    /// Points within the window, oldest first; used by the alert engine
    pub fn window_points(&self, name: &str, window_secs: f64) -> Vec<MetricPoint> {
        let now = now_epoch();
        self.series
            .get(name)
            .map(|s| s.points_since(now - window_secs))
            .unwrap_or_default()
    }

    pub fn latest(&self, name: &str) -> Option<MetricPoint> {
        self.series.get(name)?.latest().cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    pub fn list(&self) -> Vec<SeriesInfo> {
        self.series
            .iter()
            .map(|entry| {
                let s = entry.value();
                SeriesInfo {
                    name: s.name.clone(),
                    kind: s.kind,
                    unit: s.unit.clone(),
                    description: s.description.clone(),
                    data_points: s.len(),
                    latest_value: s.latest().map(|p| p.value),
                }
            })
            .collect()
    }

    /// Persist a snapshot of all series heads under `metrics:snapshot:<epoch>`
    pub async fn persist_snapshot(&self) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        let mut heads = BTreeMap::new();
        for entry in self.series.iter() {
            if let Some(point) = entry.value().latest() {
                heads.insert(entry.key().clone(), point.clone());
            }
        }
        if heads.is_empty() {
            return;
        }
        let epoch = Utc::now().timestamp();
        let payload = serde_json::json!({
            "timestamp": epoch,
            "metrics": heads,
        });
        let key = metrics_snapshot_key(epoch);
        if let Err(e) = gateway
            .set(&key, &payload.to_string(), Some(self.durability_ttl))
            .await
        {
            debug!(error = %e, "metrics snapshot persistence skipped");
        }
    }
}

fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1_000.0
}

/// Kind inference for lazily-created series
fn classify_kind(name: &str) -> MetricKind {
    if name.contains("latency") || name.ends_with("_ms") {
        MetricKind::Latency
    } else if name.contains("error") {
        MetricKind::ErrorRate
    } else if name.contains("speed") {
        MetricKind::Speed
    } else if name.contains("throughput") || name.contains("per_sec") {
        MetricKind::Throughput
    } else if name.contains("connection") || name.contains("count") {
        MetricKind::ConnectionCount
    } else if name.contains("duration") || name.contains("time") {
        MetricKind::StageDuration
    } else {
        MetricKind::ResourceUsage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreGateway;

    fn registry() -> MetricRegistry {
        MetricRegistry::new(&MetricsConfig::default())
    }

    #[tokio::test]
    async fn test_builtins_installed() {
        let reg = registry();
        for name in [
            "websocket_latency",
            "sse_latency",
            "download_speed",
            "active_connections",
            "active_tasks",
            "error_rate",
            "stage_completion_time",
            "memory_usage",
            "cpu_usage",
            "store_ops_per_sec",
        ] {
            assert!(reg.contains(name), "missing builtin {name}");
        }
    }

    #[tokio::test]
    async fn test_unknown_series_created_lazily() {
        let reg = registry();
        assert!(!reg.contains("custom_metric"));
        reg.record("custom_metric", 1.5, None).await;
        assert!(reg.contains("custom_metric"));
        assert_eq!(reg.latest("custom_metric").unwrap().value, 1.5);
    }

    #[tokio::test]
    async fn test_summary_shape() {
        let reg = registry();
        for v in [10.0, 20.0, 30.0] {
            reg.record("websocket_latency", v, None).await;
        }
        let summary = reg.summary("websocket_latency", Some(3_600.0)).unwrap();
        assert_eq!(summary.count, 3);
        assert!((summary.average - 20.0).abs() < 0.01);
        assert_eq!(summary.current, 30.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
    }

    #[tokio::test]
    async fn test_missing_series_queries_return_absent() {
        let reg = registry();
        assert!(reg.aggregate("nope", AggregateOp::Average, None).is_none());
        assert!(reg.summary("nope", None).is_none());
        assert!(reg.history("nope", 60.0, 10).is_none());
    }

    #[tokio::test]
    async fn test_persistence_writes_series_list() {
        let gateway = StoreGateway::in_memory();
        let reg = MetricRegistry::new(&MetricsConfig::default()).with_gateway(gateway.clone());

        reg.record("cpu_usage", 42.0, None).await;

        let stored = gateway
            .list_range(&metric_series_key("cpu_usage"), 0, -1)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        let point: MetricPoint = serde_json::from_str(&stored[0]).unwrap();
        assert_eq!(point.value, 42.0);
    }
}
