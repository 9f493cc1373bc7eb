//! Bounded time-series ring with windowed aggregation.

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::{AggregateOp, MetricKind, MetricPoint};

/// Minimum samples before percentile estimation is meaningful; below this
/// the max is returned instead.
const MIN_PERCENTILE_SAMPLES: usize = 2;

/// Statistical summary of one series over a window
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub current: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: u64,
}

/// One bucket of a downsampled history query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryBucket {
    pub timestamp: f64,
    /// `None` when no points landed in the bucket
    pub value: Option<f64>,
    pub count: usize,
}

/// Named, typed, bounded sequence of samples
#[derive(Debug, Clone)]
pub struct MetricSeries {
    pub name: String,
    pub kind: MetricKind,
    pub unit: String,
    pub description: String,
    capacity: usize,
    points: VecDeque<MetricPoint>,
}

impl MetricSeries {
    pub fn new(
        name: impl Into<String>,
        kind: MetricKind,
        unit: impl Into<String>,
        description: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            unit: unit.into(),
            description: description.into(),
            capacity: capacity.max(1),
            points: VecDeque::new(),
        }
    }

    /// Append one point, evicting the oldest when full
    pub fn record(&mut self, point: MetricPoint) {
        if self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&MetricPoint> {
        self.points.back()
    }

    /// Points with `timestamp >= since`, oldest first
    pub fn points_since(&self, since: f64) -> Vec<MetricPoint> {
        self.points
            .iter()
            .filter(|p| p.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Aggregate over the window `[now - window_secs, now]`. Returns `None`
    /// when the window holds no points; never a synthetic zero.
    pub fn aggregate(&self, op: AggregateOp, window_secs: Option<f64>, now: f64) -> Option<f64> {
        let values: Vec<f64> = match window_secs {
            Some(window) => self
                .points
                .iter()
                .filter(|p| p.timestamp >= now - window)
                .map(|p| p.value)
                .collect(),
            None => self.points.iter().map(|p| p.value).collect(),
        };
        if values.is_empty() {
            return None;
        }
        Some(match op {
            AggregateOp::Average => values.iter().sum::<f64>() / values.len() as f64,
            AggregateOp::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            AggregateOp::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            AggregateOp::Sum => values.iter().sum(),
            AggregateOp::Count => values.len() as f64,
            AggregateOp::P95 => nearest_rank(&values, 0.95),
            AggregateOp::P99 => nearest_rank(&values, 0.99),
        })
    }

    pub fn summary(&self, window_secs: Option<f64>, now: f64) -> Option<MetricSummary> {
        let count = self.aggregate(AggregateOp::Count, window_secs, now)?;
        Some(MetricSummary {
            current: self.latest().map(|p| p.value).unwrap_or_default(),
            average: self
                .aggregate(AggregateOp::Average, window_secs, now)
                .unwrap_or_default(),
            min: self
                .aggregate(AggregateOp::Min, window_secs, now)
                .unwrap_or_default(),
            max: self
                .aggregate(AggregateOp::Max, window_secs, now)
                .unwrap_or_default(),
            p95: self
                .aggregate(AggregateOp::P95, window_secs, now)
                .unwrap_or_default(),
            p99: self
                .aggregate(AggregateOp::P99, window_secs, now)
                .unwrap_or_default(),
            count: count as u64,
        })
    }

    /// Partition `[now - window_secs, now]` into `resolution` equal buckets
    /// and average each. Empty buckets carry `None`.
    pub fn history(&self, window_secs: f64, resolution: usize, now: f64) -> Vec<HistoryBucket> {
        let resolution = resolution.max(1);
        let interval = window_secs / resolution as f64;
        let start = now - window_secs;

        (0..resolution)
            .map(|i| {
                let bucket_start = start + i as f64 * interval;
                let bucket_end = bucket_start + interval;
                let values: Vec<f64> = self
                    .points
                    .iter()
                    .filter(|p| p.timestamp >= bucket_start && p.timestamp < bucket_end)
                    .map(|p| p.value)
                    .collect();
                HistoryBucket {
                    timestamp: bucket_start,
                    value: if values.is_empty() {
                        None
                    } else {
                        Some(values.iter().sum::<f64>() / values.len() as f64)
                    },
                    count: values.len(),
                }
            })
            .collect()
    }
}

/// Nearest-rank percentile over unsorted sample values
fn nearest_rank(values: &[f64], percentile: f64) -> f64 {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() < MIN_PERCENTILE_SAMPLES {
        return *sorted.last().unwrap_or(&0.0);
    }
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
