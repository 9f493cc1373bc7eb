//! # Task, Stage, and Aggregate Progress Records
//!
//! The task record is the unit of tracking: a caller-identified job with an
//! ordered set of named stages. Aggregate progress is derived from per-stage
//! state through the stage weight table; the derivation lives here so every
//! consumer (engine, hub, dashboard) computes the same numbers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of tracked jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Download,
    Transcription,
    Conversion,
    Upload,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Download => "download",
            TaskKind::Transcription => "transcription",
            TaskKind::Conversion => "conversion",
            TaskKind::Upload => "upload",
        }
    }

    pub const ALL: [TaskKind; 4] = [
        TaskKind::Download,
        TaskKind::Transcription,
        TaskKind::Conversion,
        TaskKind::Upload,
    ];
}

/// Task lifecycle status.
///
/// Transitions form a DAG: `pending → running → {completed|failed|cancelled}`
/// with an optional `running ↔ paused` loop. Terminal states never re-enter
/// running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];
}

/// Per-stage progress sub-record owned by a task.
///
/// Invariants: `bytes_processed <= total_bytes` when the total is known,
/// `percentage` is monotonic non-decreasing within a run, and a set
/// `completed_at` implies `percentage == 100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: String,
    pub percentage: f64,
    pub bytes_processed: u64,
    /// 0 means the total is unknown
    pub total_bytes: u64,
    /// Instantaneous rate in bytes/sec, a moving average over recent samples
    pub speed_bps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageProgress {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            percentage: 0.0,
            bytes_processed: 0,
            total_bytes: 0,
            speed_bps: 0.0,
            eta_seconds: None,
            message: String::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.percentage >= 100.0
    }
}

/// Weighted roll-up of a task's stages into one percentage and ETA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateProgress {
    /// Derived overall percentage, kept in sync by [`AggregateProgress::recompute`]
    pub percentage: f64,
    #[serde(default)]
    pub current_stage: String,
    pub stages: BTreeMap<String, StageProgress>,
    /// Normalized so weights sum to 1 over the task's stages
    pub stage_weights: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_eta_seconds: Option<u64>,
    pub average_speed_bps: f64,
    pub peak_speed_bps: f64,
}

impl AggregateProgress {
    pub fn new(stages: &[String], weights: BTreeMap<String, f64>) -> Self {
        let stages = stages
            .iter()
            .map(|s| (s.clone(), StageProgress::new(s.clone())))
            .collect();
        Self {
            percentage: 0.0,
            current_stage: String::new(),
            stages,
            stage_weights: weights,
            overall_eta_seconds: None,
            average_speed_bps: 0.0,
            peak_speed_bps: 0.0,
        }
    }

    /// Overall percentage = Σ (stage.percentage × weight) / Σ weight.
    ///
    /// The denominator guards against a weight table that does not cover
    /// every stage.
    pub fn overall_percentage(&self) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (name, weight) in &self.stage_weights {
            if let Some(stage) = self.stages.get(name) {
                weighted += stage.percentage * weight;
                total_weight += weight;
            }
        }
        if total_weight > 0.0 {
            weighted / total_weight
        } else {
            self.percentage
        }
    }

    /// Overall ETA = remaining bytes across known totals / average rate,
    /// undefined when either side is unknown.
    pub fn overall_eta(&self) -> Option<u64> {
        if self.average_speed_bps <= 0.0 {
            return None;
        }
        let overall = self.overall_percentage();
        if overall >= 100.0 {
            return Some(0);
        }
        let total: u64 = self
            .stages
            .values()
            .filter(|s| s.total_bytes > 0)
            .map(|s| s.total_bytes)
            .sum();
        if total == 0 {
            return None;
        }
        let remaining = ((100.0 - overall) / 100.0) * total as f64;
        Some((remaining / self.average_speed_bps) as u64)
    }

    /// Recompute all derived fields from per-stage state.
    pub fn recompute(&mut self) {
        let speeds: Vec<f64> = self
            .stages
            .values()
            .map(|s| s.speed_bps)
            .filter(|v| *v > 0.0)
            .collect();
        self.average_speed_bps = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f64>() / speeds.len() as f64
        };
        if let Some(max) = speeds.iter().cloned().fold(None::<f64>, |acc, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        }) {
            self.peak_speed_bps = self.peak_speed_bps.max(max);
        }
        self.percentage = self.overall_percentage();
        self.overall_eta_seconds = self.overall_eta();
    }

    pub fn all_stages_complete(&self) -> bool {
        !self.stages.is_empty() && self.stages.values().all(StageProgress::is_complete)
    }
}

/// Full task record as persisted under `task:<id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: AggregateProgress,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub events_count: u64,
}

impl TaskRecord {
    /// Whether the status transition `self.status → next` is legal.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self.status, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_overall_percentage_weighted() {
        let stages = vec!["a".to_string(), "b".to_string()];
        let mut agg = AggregateProgress::new(&stages, weights(&[("a", 0.25), ("b", 0.75)]));
        agg.stages.get_mut("a").unwrap().percentage = 100.0;
        agg.stages.get_mut("b").unwrap().percentage = 40.0;

        // 100 * 0.25 + 40 * 0.75 = 55
        assert!((agg.overall_percentage() - 55.0).abs() < 0.01);
    }

    #[test]
    fn test_overall_eta_requires_rate_and_total() {
        let stages = vec!["dl".to_string()];
        let mut agg = AggregateProgress::new(&stages, weights(&[("dl", 1.0)]));
        assert_eq!(agg.overall_eta(), None);

        {
            let stage = agg.stages.get_mut("dl").unwrap();
            stage.total_bytes = 1_000_000;
            stage.bytes_processed = 500_000;
            stage.percentage = 50.0;
            stage.speed_bps = 100_000.0;
        }
        agg.recompute();
        // 500_000 remaining at 100_000 B/s
        assert_eq!(agg.overall_eta_seconds, Some(5));
    }

    #[test]
    fn test_peak_rate_never_decreases() {
        let stages = vec!["dl".to_string()];
        let mut agg = AggregateProgress::new(&stages, weights(&[("dl", 1.0)]));
        agg.stages.get_mut("dl").unwrap().speed_bps = 2048.0;
        agg.recompute();
        assert!((agg.peak_speed_bps - 2048.0).abs() < f64::EPSILON);

        agg.stages.get_mut("dl").unwrap().speed_bps = 512.0;
        agg.recompute();
        assert!((agg.peak_speed_bps - 2048.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_terminal_states_accept_no_transitions() {
        let stages = vec!["s".to_string()];
        let mut record = TaskRecord {
            task_id: "t1".into(),
            kind: TaskKind::Download,
            status: TaskStatus::Completed,
            progress: AggregateProgress::new(&stages, weights(&[("s", 1.0)])),
            created_at: Utc::now(),
            started_at: None,
            updated_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error: None,
            metadata: BTreeMap::new(),
            events_count: 0,
        };
        for next in TaskStatus::ALL {
            assert!(!record.can_transition_to(next));
        }

        record.status = TaskStatus::Running;
        assert!(record.can_transition_to(TaskStatus::Paused));
        assert!(record.can_transition_to(TaskStatus::Completed));
        assert!(!record.can_transition_to(TaskStatus::Pending));
    }
}
