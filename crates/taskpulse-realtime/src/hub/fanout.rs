//! The hub itself: connect/disconnect lifecycle, the client frame protocol,
//! and broadcast routing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use taskpulse_progress::TaskStateReader;
use taskpulse_shared::config::HubConfig;
use taskpulse_shared::error::{PulseError, PulseResult};
use taskpulse_shared::types::{
    Channel, ClientFrame, ConnectedData, PingData, ProgressEvent, ServerFrame, ServerPayload,
    StageSnapshot, StatusRequest, StatusResponseData, SubscriptionRequest, TaskEventKind,
    TaskProgressData, TaskRecord,
};

use crate::auth::TokenValidator;

use super::connection::{ClientConnection, Mailbox, PushOutcome};
use super::registry::ConnectionRegistry;
use super::stats::{HubStatistics, HubStatsSnapshot};

/// Handle returned to a transport on connect
#[derive(Debug)]
pub struct ConnectedHandle {
    pub client_id: String,
    pub mailbox: Arc<Mailbox>,
}

/// Fan-out hub owning the connection registry
#[derive(Debug)]
pub struct FanoutHub {
    registry: ConnectionRegistry,
    stats: HubStatistics,
    config: HubConfig,
    reader: Arc<dyn TaskStateReader>,
    validator: Arc<dyn TokenValidator>,
    accepting: AtomicBool,
}

impl FanoutHub {
    pub fn new(
        config: HubConfig,
        reader: Arc<dyn TaskStateReader>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.max_connections),
            stats: HubStatistics::default(),
            config,
            reader,
            validator,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a connection. Fails with `Capacity` when the registry is
    /// full, `Conflict` on a duplicate client id, `ShuttingDown` once
    /// shutdown began. The welcome frame is already queued on success.
    pub async fn connect(
        &self,
        client_id: Option<String>,
        token: Option<&str>,
    ) -> PulseResult<ConnectedHandle> {
        self.connect_with_mode(client_id, token, false).await
    }

    /// One-way variant used by the SSE transport: the connection receives
    /// frames but never sends, and is exempt from heartbeat reaping.
    pub async fn connect_one_way(
        &self,
        client_id: Option<String>,
        token: Option<&str>,
    ) -> PulseResult<ConnectedHandle> {
        self.connect_with_mode(client_id, token, true).await
    }

    async fn connect_with_mode(
        &self,
        client_id: Option<String>,
        token: Option<&str>,
        one_way: bool,
    ) -> PulseResult<ConnectedHandle> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PulseError::ShuttingDown);
        }

        let (authenticated, user_id) = match token {
            Some(token) => match self.validator.validate(token).await {
                Ok(claims) => (true, claims.user_id),
                Err(e) => {
                    // Anonymous access stays available on auth failure
                    debug!(error = %e, "token validation failed, connecting anonymously");
                    (false, None)
                }
            },
            None => (false, None),
        };

        let client_id = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mailbox = Mailbox::new(self.config.send_buffer_limit);
        let connection = ClientConnection::new(
            client_id.clone(),
            mailbox.clone(),
            authenticated,
            user_id,
            one_way,
        );
        self.registry.insert(connection)?;
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);

        let welcome = ServerFrame::new(ServerPayload::Connected(ConnectedData {
            client_id: client_id.clone(),
            authenticated,
            server_time: Utc::now(),
            available_channels: Channel::ALL.iter().map(|c| c.to_string()).collect(),
            heartbeat_interval: self.config.heartbeat_interval_secs,
            features: Default::default(),
        }));
        self.deliver(&client_id, &mailbox, welcome);

        info!(client_id, authenticated, "client connected");
        Ok(ConnectedHandle { client_id, mailbox })
    }

    /// Remove a connection from all indices and close its mailbox.
    /// Idempotent.
    pub fn disconnect(&self, client_id: &str, reason: &str) {
        if let Some(connection) = self.registry.remove(client_id) {
            connection.mailbox.close();
            self.stats
                .dropped_frames
                .fetch_add(connection.mailbox.dropped_count(), Ordering::Relaxed);
            info!(client_id, reason, "client disconnected");
        }
    }

    /// Stop accepting connections and close every live one.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        for client_id in self.registry.all_ids() {
            self.disconnect(&client_id, "server_shutdown");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    // =========================================================================
    // Client protocol
    // =========================================================================

    /// Handle one incoming text frame from a client.
    pub async fn handle_frame(&self, client_id: &str, text: &str) {
        if !self.registry.contains(client_id) {
            return;
        }
        self.registry.record_received(client_id);
        self.registry.touch_heartbeat(client_id);
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.send_error(client_id, &e.to_string());
                return;
            }
        };

        match frame {
            ClientFrame::Subscribe(request) => self.handle_subscribe(client_id, request, true),
            ClientFrame::Unsubscribe(request) => self.handle_subscribe(client_id, request, false),
            ClientFrame::Ping(data) => self.handle_ping(client_id, data),
            ClientFrame::GetStatus(request) => self.handle_get_status(client_id, request).await,
        }
    }

    fn handle_subscribe(&self, client_id: &str, request: SubscriptionRequest, subscribe: bool) {
        let mut channels = Vec::new();
        let mut unknown = Vec::new();
        for name in &request.channels {
            match name.parse::<Channel>() {
                Ok(channel) => channels.push(channel),
                Err(_) => unknown.push(name.clone()),
            }
        }
        if !unknown.is_empty() {
            self.send_error(client_id, &format!("unknown channels: {}", unknown.join(", ")));
        }

        if subscribe {
            self.registry.subscribe_tasks(client_id, &request.task_ids);
            self.registry.subscribe_channels(client_id, &channels);
        } else {
            self.registry.unsubscribe_tasks(client_id, &request.task_ids);
            self.registry.unsubscribe_channels(client_id, &channels);
        }

        let (tasks, channels) = self.registry.subscriptions_of(client_id);
        self.send_to(
            client_id,
            ServerPayload::StatusResponse(StatusResponseData {
                subscribed_tasks: Some(tasks),
                subscribed_channels: Some(channels.iter().map(|c| c.to_string()).collect()),
                success: Some(true),
                ..Default::default()
            }),
        );
    }

    fn handle_ping(&self, client_id: &str, data: PingData) {
        self.send_to(
            client_id,
            ServerPayload::Pong {
                timestamp: Utc::now(),
                client_id: client_id.to_string(),
                latency_test: data.timestamp,
            },
        );
    }

    async fn handle_get_status(&self, client_id: &str, request: StatusRequest) {
        let mut task_status = BTreeMap::new();
        for task_id in &request.task_ids {
            match self.reader.task(task_id).await {
                Ok(Some(record)) => {
                    task_status.insert(task_id.clone(), status_summary(&record));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id, error = %e, "status resolution failed");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.send_to(
            client_id,
            ServerPayload::StatusResponse(StatusResponseData {
                task_status: Some(task_status),
                requested_tasks: Some(request.task_ids),
                ..Default::default()
            }),
        );
    }

    // =========================================================================
    // Broadcast
    // =========================================================================

    /// Route one progress event to the task's subscribers. The current
    /// aggregate state is reloaded through the read-only handle so frames
    /// reflect committed state, not the event payload alone.
    pub async fn broadcast_event(&self, event: &ProgressEvent) {
        let subscribers = self.registry.task_subscribers(&event.task_id);
        if subscribers.is_empty() {
            return;
        }

        let record = match self.reader.task(&event.task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(task_id = %event.task_id, "event for unknown task, skipping fan-out");
                return;
            }
            Err(e) => {
                warn!(task_id = %event.task_id, error = %e, "state reload failed, skipping fan-out");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let payload = match event.event_type {
            TaskEventKind::TaskCompleted => ServerPayload::TaskComplete {
                task_id: record.task_id.clone(),
                status: record.status,
                total_duration_seconds: record.completed_at.and_then(|done| {
                    record
                        .started_at
                        .or(Some(record.created_at))
                        .map(|start| (done - start).num_milliseconds() as f64 / 1_000.0)
                }),
                final_progress: record.progress.percentage,
                stages_completed: record
                    .progress
                    .stages
                    .values()
                    .filter(|s| s.is_complete())
                    .count(),
            },
            TaskEventKind::TaskFailed | TaskEventKind::TaskCancelled => ServerPayload::TaskError {
                task_id: record.task_id.clone(),
                error: event
                    .error
                    .clone()
                    .or_else(|| record.error.clone())
                    .unwrap_or_else(|| event.message.clone()),
                status: record.status,
                current_stage: Some(record.progress.current_stage.clone()),
            },
            _ => match &event.stage {
                Some(stage) => ServerPayload::StageUpdate(progress_data(&record, Some(stage))),
                None => ServerPayload::ProgressUpdate(progress_data(&record, None)),
            },
        };

        self.fan_out(subscribers, payload);
    }

    /// Broadcast a system alert to the `alerts` channel.
    pub fn broadcast_system_alert(&self, alert_type: &str, message: &str, data: Value) {
        let subscribers = self.registry.channel_subscribers(Channel::Alerts);
        if subscribers.is_empty() {
            return;
        }
        self.fan_out(
            subscribers,
            ServerPayload::SystemAlert {
                alert_type: alert_type.to_string(),
                message: message.to_string(),
                data,
            },
        );
    }

    /// Broadcast an arbitrary frame to one channel's subscribers.
    pub fn broadcast_to_channel(&self, channel: Channel, payload: ServerPayload) {
        let subscribers = self.registry.channel_subscribers(channel);
        self.fan_out(subscribers, payload);
    }

    fn fan_out(&self, subscribers: Vec<(String, Arc<Mailbox>)>, payload: ServerPayload) {
        for (client_id, mailbox) in subscribers {
            let frame = ServerFrame::new(payload.clone());
            self.deliver(&client_id, &mailbox, frame);
        }
    }

    /// Queue a frame for one connection; a closed mailbox marks the
    /// connection for disconnect without touching the others.
    fn deliver(&self, client_id: &str, mailbox: &Arc<Mailbox>, frame: ServerFrame) {
        match mailbox.push(frame) {
            PushOutcome::Queued => {
                self.registry.record_sent(client_id);
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::QueuedAfterDrop | PushOutcome::Dropped => {
                self.registry.record_sent(client_id);
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Closed => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.disconnect(client_id, "send error");
            }
        }
    }

    fn send_to(&self, client_id: &str, payload: ServerPayload) {
        if let Some(mailbox) = self.registry.mailbox_of(client_id) {
            self.deliver(client_id, &mailbox, ServerFrame::new(payload));
        }
    }

    fn send_error(&self, client_id: &str, error: &str) {
        self.send_to(
            client_id,
            ServerPayload::Error {
                error: error.to_string(),
            },
        );
    }

    // =========================================================================
    // Heartbeat and stats
    // =========================================================================

    /// Disconnect connections whose heartbeat age exceeds the client
    /// timeout. Runs on the heartbeat interval.
    pub fn heartbeat_sweep(&self) {
        let stale = self
            .registry
            .stale_connections(Duration::from_secs(self.config.client_timeout_secs));
        for client_id in stale {
            self.disconnect(&client_id, "timeout");
        }
        if !self.registry.is_empty() {
            debug!(
                active = self.registry.len(),
                avg_latency_ms = self.stats.average_send_latency_ms(),
                "hub heartbeat"
            );
        }
    }

    pub fn record_send_latency(&self, latency: Duration) {
        self.stats.record_send_latency(latency);
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        self.stats.snapshot(
            self.registry.len(),
            self.registry.max_connections(),
            self.config.heartbeat_interval_secs,
            self.config.client_timeout_secs,
            self.registry.subscription_counts(),
        )
    }
}

/// Full per-stage snapshot for outgoing progress frames
fn progress_data(record: &TaskRecord, updated_stage: Option<&str>) -> TaskProgressData {
    let stages: BTreeMap<String, StageSnapshot> = record
        .progress
        .stages
        .iter()
        .map(|(name, stage)| {
            (
                name.clone(),
                StageSnapshot {
                    percentage: stage.percentage,
                    bytes_processed: stage.bytes_processed,
                    total_bytes: stage.total_bytes,
                    speed_bps: stage.speed_bps,
                    eta_seconds: stage.eta_seconds,
                    message: stage.message.clone(),
                },
            )
        })
        .collect();
    let stage_details = updated_stage.and_then(|s| stages.get(s).cloned());

    TaskProgressData {
        task_id: record.task_id.clone(),
        status: record.status,
        progress: record.progress.percentage,
        current_stage: record.progress.current_stage.clone(),
        eta_seconds: record.progress.overall_eta_seconds,
        average_speed_bps: record.progress.average_speed_bps,
        peak_speed_bps: record.progress.peak_speed_bps,
        stages,
        updated_stage: updated_stage.map(str::to_string),
        stage_details,
    }
}

fn status_summary(record: &TaskRecord) -> Value {
    json!({
        "status": record.status,
        "progress": record.progress.percentage,
        "current_stage": record.progress.current_stage,
        "eta_seconds": record.progress.overall_eta_seconds,
        "stages": record
            .progress
            .stages
            .iter()
            .map(|(name, stage)| {
                (
                    name.clone(),
                    json!({
                        "percentage": stage.percentage,
                        "eta_seconds": stage.eta_seconds,
                        "speed_bps": stage.speed_bps,
                    }),
                )
            })
            .collect::<BTreeMap<String, Value>>(),
    })
}
