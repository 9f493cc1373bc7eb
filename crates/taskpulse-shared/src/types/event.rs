//! Timeline events and the published progress event payload.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::{AggregateProgress, TaskKind, TaskStatus};

/// Event kinds recorded on a task's timeline and carried on the pub/sub
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskCreated,
    StageStarted,
    StageProgress,
    StageCompleted,
    StageFailed,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

impl TaskEventKind {
    /// Terminal events always reach subscribers even under backpressure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEventKind::TaskCompleted | TaskEventKind::TaskFailed | TaskEventKind::TaskCancelled
        )
    }
}

/// One entry in a task's append-only timeline (`events:<id>`, newest first)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: TaskEventKind,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl TimelineEvent {
    pub fn new(event_type: TaskEventKind, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            stage: stage.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Payload published on the `progress_updates` channel.
///
/// Carries the full aggregate snapshot so subscribers never need a second
/// round-trip to render the update. Publication is fire-and-forget; the
/// engine never assumes a subscriber is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub task_type: TaskKind,
    pub event_type: TaskEventKind,
    pub status: TaskStatus,
    pub progress: AggregateProgress,
    /// Stage the event concerns, absent for task-level events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn matches_task(&self, task_id: &str) -> bool {
        self.task_id == task_id
    }
}
