//! # Progress Engine
//!
//! Task lifecycle, stage state, aggregate recomputation, timeline, and
//! event publication. The engine is the only writer of `task:*`,
//! `events:*`, and the active/completed indices.
//!
//! Publication ordering: persistent writes commit first, the event goes out
//! second. A failed persist suppresses the event and rolls the in-memory
//! rate estimator back, so retries never double-count.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use taskpulse_shared::config::ProgressConfig;
use taskpulse_shared::error::{PulseError, PulseResult};
use taskpulse_shared::store::{
    events_key, task_id_from_key, task_key, Pipeline, StoreCommand, StoreGateway, ACTIVE_TASKS_KEY,
    COMPLETED_TASKS_KEY, PROGRESS_CHANNEL, TASK_KEY_PREFIX,
};
use taskpulse_shared::types::{
    AggregateProgress, ProgressEvent, TaskEventKind, TaskKind, TaskRecord, TaskStatus,
    TimelineEvent,
};

use crate::rates::RateBook;
use crate::weights;

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Read-only view of task state, handed to the fan-out hub and the
/// dashboard so they never hold an owning link back into the engine.
#[async_trait::async_trait]
pub trait TaskStateReader: Send + Sync + std::fmt::Debug {
    async fn task(&self, task_id: &str) -> PulseResult<Option<TaskRecord>>;
    async fn timeline(
        &self,
        task_id: &str,
        limit: usize,
        offset: usize,
    ) -> PulseResult<Vec<TimelineEvent>>;
    async fn active_task_ids(&self) -> PulseResult<Vec<String>>;
}

/// Roll-up counters over the whole task keyspace
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProgressStatistics {
    pub tasks_by_status: BTreeMap<String, u64>,
    pub tasks_by_kind: BTreeMap<String, u64>,
    pub active_tasks: u64,
    pub total_events: u64,
}

/// Owner of task lifecycle and progress state
#[derive(Debug)]
pub struct ProgressEngine {
    gateway: StoreGateway,
    config: ProgressConfig,
    rates: RateBook,
    events_tx: broadcast::Sender<ProgressEvent>,
    /// Per-task timeline sampling window: (window start, appends within it)
    sampler: Mutex<HashMap<String, (Instant, u32)>>,
}

impl ProgressEngine {
    pub fn new(gateway: StoreGateway, config: ProgressConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let rates = RateBook::new(config.rate_window_samples);
        Self {
            gateway,
            config,
            rates,
            events_tx,
            sampler: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &StoreGateway {
        &self.gateway
    }

    /// In-process subscription to every published event
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events_tx.subscribe()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Create a task with its ordered stages. Fails with `Conflict` if the
    /// id is live; a task with zero stages is rejected.
    pub async fn create_task(
        &self,
        task_id: &str,
        kind: TaskKind,
        stages: Vec<String>,
        stage_weights: Option<BTreeMap<String, f64>>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> PulseResult<TaskRecord> {
        if task_id.is_empty() {
            return Err(PulseError::Validation("task id must not be empty".into()));
        }
        if stages.is_empty() {
            return Err(PulseError::Validation(
                "task requires at least one stage".into(),
            ));
        }
        if self.gateway.hash_get(&task_key(task_id), "data").await?.is_some() {
            return Err(PulseError::Conflict(format!("task {task_id} already exists")));
        }

        let weights = match stage_weights {
            Some(provided) => weights::normalize(provided),
            None => weights::default_weights(kind, &stages),
        };
        let now = Utc::now();
        let record = TaskRecord {
            task_id: task_id.to_string(),
            kind,
            status: TaskStatus::Pending,
            progress: AggregateProgress::new(&stages, weights.clone()),
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            error: None,
            metadata: metadata.unwrap_or_default(),
            events_count: 0,
        };

        let created = TimelineEvent::new(
            TaskEventKind::TaskCreated,
            "initialization",
            format!("Task {} created with {} stages", kind.as_str(), stages.len()),
        )
        .with_metadata(BTreeMap::from([
            ("stages".to_string(), json!(stages)),
            ("weights".to_string(), json!(weights)),
        ]));

        let mut pipeline = self.record_pipeline(&record)?;
        pipeline.commands.push(StoreCommand::SetAdd {
            key: ACTIVE_TASKS_KEY.into(),
            member: task_id.into(),
        });
        pipeline.commands.push(StoreCommand::Expire {
            key: task_key(task_id),
            ttl: Duration::from_secs(self.config.task_ttl_days * 24 * 3_600),
        });
        self.append_event_commands(&mut pipeline, task_id, &created)?;
        self.gateway.pipeline(pipeline).await?;

        info!(task_id, kind = kind.as_str(), stages = record.progress.stages.len(), "task created");
        Ok(record)
    }

    /// Start a stage. Idempotent when the stage is already started. The
    /// first stage start moves a pending task into running.
    pub async fn start_stage(
        &self,
        task_id: &str,
        stage: &str,
        total_bytes: Option<u64>,
        message: Option<&str>,
    ) -> PulseResult<()> {
        let Some(mut record) = self.load_live(task_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        {
            let Some(entry) = record.progress.stages.get_mut(stage) else {
                warn!(task_id, stage, "stage not declared on task, ignoring start");
                return Ok(());
            };
            if entry.started_at.is_some() {
                debug!(task_id, stage, "stage already started");
                return Ok(());
            }
            entry.started_at = Some(now);
            if let Some(total) = total_bytes {
                entry.total_bytes = total;
            }
            if let Some(message) = message {
                entry.message = message.to_string();
            }
        }
        if record.status == TaskStatus::Pending {
            record.status = TaskStatus::Running;
            record.started_at = Some(now);
        }
        record.progress.current_stage = stage.to_string();
        record.updated_at = now;

        self.rates.start(task_id, stage);

        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Stage started: {stage}"));
        let event = TimelineEvent::new(TaskEventKind::StageStarted, stage, message.clone())
            .with_metadata(BTreeMap::from([(
                "total_bytes".to_string(),
                json!(total_bytes),
            )]));

        let mut pipeline = self.record_pipeline(&record)?;
        self.append_event_commands(&mut pipeline, task_id, &event)?;
        if let Err(e) = self.gateway.pipeline(pipeline).await {
            self.rates.finish(task_id, stage);
            return Err(e.into());
        }

        self.publish(&record, TaskEventKind::StageStarted, Some(stage), &message, None)
            .await;
        info!(task_id, stage, "stage started");
        Ok(())
    }

    /// Record stage progress. Updates against unknown or terminal tasks are
    /// dropped with a logged warning rather than failing the worker.
    pub async fn update_stage_progress(
        &self,
        task_id: &str,
        stage: &str,
        bytes_processed: u64,
        percentage: Option<f64>,
        message: Option<&str>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> PulseResult<()> {
        let Some(mut record) = self.load_live(task_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let speed;
        let stage_pct;
        {
            let Some(entry) = record.progress.stages.get_mut(stage) else {
                warn!(task_id, stage, "stage not declared on task, dropping update");
                return Ok(());
            };
            speed = self.rates.record(task_id, stage, bytes_processed);
            entry.bytes_processed = if entry.total_bytes > 0 {
                bytes_processed.min(entry.total_bytes)
            } else {
                bytes_processed
            };

            let computed = match percentage {
                Some(p) => p.clamp(0.0, 100.0),
                None if entry.total_bytes > 0 => {
                    (entry.bytes_processed as f64 / entry.total_bytes as f64 * 100.0).min(100.0)
                }
                None => entry.percentage,
            };
            // Monotonic within a run
            entry.percentage = entry.percentage.max(computed);

            entry.speed_bps = speed;
            entry.eta_seconds = if speed > 0.0 && entry.total_bytes > entry.bytes_processed {
                Some(((entry.total_bytes - entry.bytes_processed) as f64 / speed) as u64)
            } else {
                None
            };
            if entry.started_at.is_none() && entry.percentage > 0.0 {
                entry.started_at = Some(now);
            }
            if let Some(message) = message {
                entry.message = message.to_string();
            }
            stage_pct = entry.percentage;
        }
        if let Some(extra) = metadata {
            record.metadata.extend(extra);
        }
        record.progress.current_stage = stage.to_string();
        record.progress.recompute();
        record.updated_at = now;

        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Progress: {stage_pct:.1}%"));

        let mut pipeline = self.record_pipeline(&record)?;
        if self.should_log_timeline(task_id) {
            let event = TimelineEvent::new(TaskEventKind::StageProgress, stage, message.clone())
                .with_metadata(BTreeMap::from([
                    ("bytes_processed".to_string(), json!(bytes_processed)),
                    ("percentage".to_string(), json!(stage_pct)),
                    ("speed_bps".to_string(), json!(speed)),
                ]));
            self.append_event_commands(&mut pipeline, task_id, &event)?;
        }
        if let Err(e) = self.gateway.pipeline(pipeline).await {
            self.rates.rollback(task_id, stage);
            return Err(e.into());
        }

        self.publish(&record, TaskEventKind::StageProgress, Some(stage), &message, None)
            .await;
        Ok(())
    }

    /// Complete a stage; completing the last open stage completes the task.
    pub async fn complete_stage(
        &self,
        task_id: &str,
        stage: &str,
        message: Option<&str>,
    ) -> PulseResult<()> {
        let Some(mut record) = self.load_live(task_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        {
            let Some(entry) = record.progress.stages.get_mut(stage) else {
                warn!(task_id, stage, "stage not declared on task, ignoring completion");
                return Ok(());
            };
            entry.percentage = 100.0;
            entry.completed_at = Some(now);
            entry.eta_seconds = Some(0);
            if entry.started_at.is_none() {
                entry.started_at = Some(now);
            }
        }
        record.progress.recompute();
        record.updated_at = now;
        self.rates.finish(task_id, stage);

        let all_complete = record.progress.all_stages_complete();
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Stage completed: {stage}"));
        let event = TimelineEvent::new(TaskEventKind::StageCompleted, stage, message.clone())
            .with_metadata(BTreeMap::from([(
                "all_stages_completed".to_string(),
                json!(all_complete),
            )]));

        let mut pipeline = self.record_pipeline(&record)?;
        self.append_event_commands(&mut pipeline, task_id, &event)?;
        self.gateway.pipeline(pipeline).await?;
        self.publish(&record, TaskEventKind::StageCompleted, Some(stage), &message, None)
            .await;
        info!(task_id, stage, "stage completed");

        if all_complete {
            self.complete_task(task_id, Some("All stages completed")).await?;
        }
        Ok(())
    }

    /// Fail a stage; the task transitions to failed and never recovers.
    pub async fn fail_stage(
        &self,
        task_id: &str,
        stage: &str,
        error: &str,
        message: Option<&str>,
    ) -> PulseResult<()> {
        let Some(mut record) = self.load_live(task_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Stage failed: {stage}"));

        record.status = TaskStatus::Failed;
        record.error = Some(format!("Stage {stage} failed: {error}"));
        record.completed_at = Some(now);
        record.updated_at = now;
        self.rates.clear_task(task_id);

        let stage_event = TimelineEvent::new(TaskEventKind::StageFailed, stage, message.clone())
            .with_metadata(BTreeMap::from([("error".to_string(), json!(error))]));
        let task_event = TimelineEvent::new(
            TaskEventKind::TaskFailed,
            stage,
            format!("Task failed in stage {stage}"),
        );

        let mut pipeline = self.record_pipeline(&record)?;
        self.append_event_commands(&mut pipeline, task_id, &stage_event)?;
        self.append_event_commands(&mut pipeline, task_id, &task_event)?;
        self.append_terminal_commands(&mut pipeline, &record);
        self.gateway.pipeline(pipeline).await?;

        self.publish(&record, TaskEventKind::StageFailed, Some(stage), &message, Some(error))
            .await;
        self.publish(&record, TaskEventKind::TaskFailed, None, &message, Some(error))
            .await;
        warn!(task_id, stage, error, "stage failed, task failed");
        Ok(())
    }

    /// Mark a task completed and retire it from the active index.
    pub async fn complete_task(&self, task_id: &str, message: Option<&str>) -> PulseResult<()> {
        let Some(mut record) = self.load_live(task_id).await? else {
            return Ok(());
        };
        if !record.can_transition_to(TaskStatus::Completed) {
            warn!(task_id, status = record.status.as_str(), "ignoring completion of non-running task");
            return Ok(());
        }

        let now = Utc::now();
        record.status = TaskStatus::Completed;
        record.completed_at = Some(now);
        record.updated_at = now;
        self.rates.clear_task(task_id);

        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| "Task completed".to_string());
        let event = TimelineEvent::new(TaskEventKind::TaskCompleted, "", message.clone());

        let mut pipeline = self.record_pipeline(&record)?;
        self.append_event_commands(&mut pipeline, task_id, &event)?;
        self.append_terminal_commands(&mut pipeline, &record);
        self.gateway.pipeline(pipeline).await?;

        self.publish(&record, TaskEventKind::TaskCompleted, None, &message, None)
            .await;
        info!(task_id, "task completed");
        Ok(())
    }

    /// Cancel a pending, running, or paused task.
    pub async fn cancel_task(&self, task_id: &str, message: Option<&str>) -> PulseResult<()> {
        let Some(mut record) = self.load_live(task_id).await? else {
            return Ok(());
        };
        if !record.can_transition_to(TaskStatus::Cancelled) {
            warn!(task_id, status = record.status.as_str(), "ignoring cancellation of terminal task");
            return Ok(());
        }

        let now = Utc::now();
        record.status = TaskStatus::Cancelled;
        record.completed_at = Some(now);
        record.updated_at = now;
        self.rates.clear_task(task_id);

        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| "Task cancelled".to_string());
        let event = TimelineEvent::new(TaskEventKind::TaskCancelled, "", message.clone());

        let mut pipeline = self.record_pipeline(&record)?;
        self.append_event_commands(&mut pipeline, task_id, &event)?;
        self.append_terminal_commands(&mut pipeline, &record);
        self.gateway.pipeline(pipeline).await?;

        self.publish(&record, TaskEventKind::TaskCancelled, None, &message, None)
            .await;
        info!(task_id, "task cancelled");
        Ok(())
    }

    /// Resolve a task record; absent or TTL-expired ids return `None`.
    pub async fn get_task(&self, task_id: &str) -> PulseResult<Option<TaskRecord>> {
        let key = task_key(task_id);
        let Some(data) = self.gateway.hash_get(&key, "data").await? else {
            return Ok(None);
        };
        let mut record: TaskRecord = serde_json::from_str(&data)?;
        if let Some(count) = self.gateway.hash_get(&key, "events_count").await? {
            record.events_count = count.parse().unwrap_or(record.events_count);
        }
        Ok(Some(record))
    }

    /// Timeline in reverse-chronological order (newest first).
    pub async fn get_timeline(
        &self,
        task_id: &str,
        limit: usize,
        offset: usize,
    ) -> PulseResult<Vec<TimelineEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .gateway
            .list_range(
                &events_key(task_id),
                offset as i64,
                (offset + limit - 1) as i64,
            )
            .await?;
        let mut events = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<TimelineEvent>(&entry) {
                Ok(event) => events.push(event),
                Err(e) => warn!(task_id, error = %e, "skipping undecodable timeline entry"),
            }
        }
        Ok(events)
    }

    pub async fn active_task_ids(&self) -> PulseResult<Vec<String>> {
        Ok(self.gateway.set_members(ACTIVE_TASKS_KEY).await?)
    }

    /// Roll-up over all task records; iterates the keyspace cooperatively.
    pub async fn statistics(&self) -> PulseResult<ProgressStatistics> {
        let mut stats = ProgressStatistics::default();
        for status in TaskStatus::ALL {
            stats.tasks_by_status.insert(status.as_str().to_string(), 0);
        }
        for kind in TaskKind::ALL {
            stats.tasks_by_kind.insert(kind.as_str().to_string(), 0);
        }

        let keys = self.gateway.scan(&format!("{TASK_KEY_PREFIX}*")).await?;
        for key in keys {
            let Some(task_id) = task_id_from_key(&key) else {
                continue;
            };
            let Some(record) = self.get_task(task_id).await? else {
                continue;
            };
            *stats
                .tasks_by_status
                .entry(record.status.as_str().to_string())
                .or_default() += 1;
            *stats
                .tasks_by_kind
                .entry(record.kind.as_str().to_string())
                .or_default() += 1;
            stats.total_events += record.events_count;
            tokio::task::yield_now().await;
        }
        stats.active_tasks = self.gateway.set_len(ACTIVE_TASKS_KEY).await?;
        Ok(stats)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Load a record, dropping updates for missing or terminal tasks.
    async fn load_live(&self, task_id: &str) -> PulseResult<Option<TaskRecord>> {
        match self.get_task(task_id).await? {
            None => {
                warn!(task_id, "task not found, dropping operation");
                Ok(None)
            }
            Some(record) if record.status.is_terminal() => {
                warn!(task_id, status = record.status.as_str(), "task is terminal, dropping operation");
                Ok(None)
            }
            Some(record) => Ok(Some(record)),
        }
    }

    /// Base pipeline persisting the record hash
    fn record_pipeline(&self, record: &TaskRecord) -> PulseResult<Pipeline> {
        let data = serde_json::to_string(record)?;
        Ok(Pipeline::transactional().push(StoreCommand::HashSet {
            key: task_key(&record.task_id),
            fields: vec![
                ("data".to_string(), data),
                ("last_update".to_string(), record.updated_at.to_rfc3339()),
                ("created_at".to_string(), record.created_at.to_rfc3339()),
            ],
        }))
    }

    /// Timeline append: push, trim to bound, bump the live event counter
    fn append_event_commands(
        &self,
        pipeline: &mut Pipeline,
        task_id: &str,
        event: &TimelineEvent,
    ) -> PulseResult<()> {
        let key = events_key(task_id);
        pipeline.commands.push(StoreCommand::ListPush {
            key: key.clone(),
            value: serde_json::to_string(event)?,
        });
        pipeline.commands.push(StoreCommand::ListTrim {
            key,
            start: 0,
            stop: self.config.max_events_per_task as i64 - 1,
        });
        pipeline.commands.push(StoreCommand::HashIncr {
            key: task_key(task_id),
            field: "events_count".to_string(),
            by: 1,
        });
        Ok(())
    }

    /// Index maintenance for terminal transitions
    fn append_terminal_commands(&self, pipeline: &mut Pipeline, record: &TaskRecord) {
        pipeline.commands.push(StoreCommand::SetRemove {
            key: ACTIVE_TASKS_KEY.into(),
            member: record.task_id.clone(),
        });
        let score = record
            .completed_at
            .unwrap_or(record.updated_at)
            .timestamp() as f64;
        pipeline.commands.push(StoreCommand::SortedAdd {
            key: COMPLETED_TASKS_KEY.into(),
            score,
            member: record.task_id.clone(),
        });
    }

    /// Timeline sampling: at most `timeline_sample_rate_per_sec` appends per
    /// task per second. Published events are never sampled.
    fn should_log_timeline(&self, task_id: &str) -> bool {
        let limit = self.config.timeline_sample_rate_per_sec;
        if limit == 0 {
            return true;
        }
        let mut sampler = self.sampler.lock().unwrap_or_else(|p| p.into_inner());
        let entry = sampler
            .entry(task_id.to_string())
            .or_insert_with(|| (Instant::now(), 0));
        if entry.0.elapsed() >= Duration::from_secs(1) {
            *entry = (Instant::now(), 0);
        }
        entry.1 += 1;
        entry.1 <= limit
    }

    /// Publish one event: store pub/sub first (cross-process), then the
    /// in-process channel. Both are fire-and-forget.
    async fn publish(
        &self,
        record: &TaskRecord,
        event_type: TaskEventKind,
        stage: Option<&str>,
        message: &str,
        error: Option<&str>,
    ) {
        let event = ProgressEvent {
            task_id: record.task_id.clone(),
            task_type: record.kind,
            event_type,
            status: record.status,
            progress: record.progress.clone(),
            stage: stage.map(str::to_string),
            message: message.to_string(),
            error: error.map(str::to_string),
            timestamp: Utc::now(),
        };
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = self.gateway.publish(PROGRESS_CHANNEL, &payload).await {
                    warn!(task_id = %record.task_id, error = %e, "event publication failed");
                }
            }
            Err(e) => warn!(task_id = %record.task_id, error = %e, "event not serializable"),
        }
        let _ = self.events_tx.send(event);
    }
}

#[async_trait::async_trait]
impl TaskStateReader for ProgressEngine {
    async fn task(&self, task_id: &str) -> PulseResult<Option<TaskRecord>> {
        self.get_task(task_id).await
    }

    async fn timeline(
        &self,
        task_id: &str,
        limit: usize,
        offset: usize,
    ) -> PulseResult<Vec<TimelineEvent>> {
        self.get_timeline(task_id, limit, offset).await
    }

    async fn active_task_ids(&self) -> PulseResult<Vec<String>> {
        self.active_task_ids().await
    }
}
