//! Metric series primitives: point, kind, and aggregation operators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Latency,
    Throughput,
    ErrorRate,
    ConnectionCount,
    StageDuration,
    Speed,
    ResourceUsage,
}

/// Aggregations supported over a time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Average,
    Min,
    Max,
    Sum,
    Count,
    P95,
    P99,
}

/// One sample in a series. Timestamps are epoch seconds so window math and
/// bucket arithmetic stay in plain `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: f64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MetricPoint {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self {
            timestamp,
            value,
            labels: BTreeMap::new(),
        }
    }
}
