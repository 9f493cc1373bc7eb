//! # Wire Frames
//!
//! The client ↔ server protocol for the bidirectional stream and the one-way
//! event stream. Incoming frames are parsed leniently (a missing `data`
//! object is treated as empty); outgoing frames are one sum type so a new
//! frame kind cannot be forgotten anywhere it is handled.
//!
//! Every outgoing frame carries `{type, data, timestamp, message_id}` where
//! `timestamp` is ISO-8601 UTC and `message_id` is a short opaque token.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PulseError;

use super::task::TaskStatus;

/// Named subscription targets shared across tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Progress,
    System,
    Alerts,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Progress, Channel::System, Channel::Alerts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Progress => "progress",
            Channel::System => "system",
            Channel::Alerts => "alerts",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Channel::Progress),
            "system" => Ok(Channel::System),
            "alerts" => Ok(Channel::Alerts),
            other => Err(PulseError::Validation(format!("unknown channel: {other}"))),
        }
    }
}

// =============================================================================
// Incoming frames
// =============================================================================

/// Task-id and channel lists for subscribe/unsubscribe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingData {
    /// Echoed back in the pong for client-side RTT measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub task_ids: Vec<String>,
}

/// Parsed incoming frame
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Subscribe(SubscriptionRequest),
    Unsubscribe(SubscriptionRequest),
    Ping(PingData),
    GetStatus(StatusRequest),
}

#[derive(Deserialize)]
struct RawClientFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    data: Value,
}

impl ClientFrame {
    /// Parse a raw text frame. Unknown types and malformed payloads are
    /// validation errors surfaced to the originator as an `error` frame.
    pub fn parse(text: &str) -> Result<Self, PulseError> {
        let raw: RawClientFrame = serde_json::from_str(text)
            .map_err(|e| PulseError::Validation(format!("invalid frame: {e}")))?;
        let data = if raw.data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            raw.data
        };
        let frame = match raw.frame_type.as_str() {
            "subscribe" => ClientFrame::Subscribe(
                serde_json::from_value(data)
                    .map_err(|e| PulseError::Validation(format!("invalid subscribe data: {e}")))?,
            ),
            "unsubscribe" => ClientFrame::Unsubscribe(
                serde_json::from_value(data).map_err(|e| {
                    PulseError::Validation(format!("invalid unsubscribe data: {e}"))
                })?,
            ),
            "ping" => ClientFrame::Ping(
                serde_json::from_value(data)
                    .map_err(|e| PulseError::Validation(format!("invalid ping data: {e}")))?,
            ),
            "get_status" => ClientFrame::GetStatus(
                serde_json::from_value(data)
                    .map_err(|e| PulseError::Validation(format!("invalid get_status data: {e}")))?,
            ),
            other => {
                return Err(PulseError::Validation(format!(
                    "unknown message type: {other}"
                )))
            }
        };
        Ok(frame)
    }
}

// =============================================================================
// Outgoing frames
// =============================================================================

/// Feature flags advertised in the welcome frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub multi_task_subscribe: bool,
    pub channel_subscribe: bool,
    pub real_time_metrics: bool,
    pub stage_level_updates: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            multi_task_subscribe: true,
            channel_subscribe: true,
            real_time_metrics: true,
            stage_level_updates: true,
        }
    }
}

/// Welcome frame data sent on connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedData {
    pub client_id: String,
    pub authenticated: bool,
    pub server_time: DateTime<Utc>,
    pub available_channels: Vec<String>,
    pub heartbeat_interval: u64,
    pub features: FeatureFlags,
}

/// Per-stage snapshot carried in progress frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub percentage: f64,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub speed_bps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub message: String,
}

/// Body of `progress_update` and `stage_update` frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressData {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub current_stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub average_speed_bps: f64,
    pub peak_speed_bps: f64,
    pub stages: BTreeMap<String, StageSnapshot>,
    /// Set on `stage_update` frames only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_details: Option<StageSnapshot>,
}

/// Body of `status_response` frames: subscription acks and `get_status`
/// answers share the frame type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribed_tasks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribed_channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_status: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_tasks: Option<Vec<String>>,
}

/// Outgoing frame payload, adjacently tagged as `{"type": ..., "data": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerPayload {
    Connected(ConnectedData),
    ProgressUpdate(TaskProgressData),
    StageUpdate(TaskProgressData),
    TaskComplete {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_duration_seconds: Option<f64>,
        final_progress: f64,
        stages_completed: usize,
    },
    TaskError {
        task_id: String,
        error: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_stage: Option<String>,
    },
    SystemAlert {
        alert_type: String,
        message: String,
        #[serde(default)]
        data: Value,
    },
    Pong {
        timestamp: DateTime<Utc>,
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_test: Option<Value>,
    },
    StatusResponse(StatusResponseData),
    Error {
        error: String,
    },
}

impl ServerPayload {
    /// Frames the backpressure policy may discard. Terminal and alert frames
    /// are never dropped.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            ServerPayload::ProgressUpdate(_) | ServerPayload::StageUpdate(_)
        )
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerPayload::Connected(_) => "connected",
            ServerPayload::ProgressUpdate(_) => "progress_update",
            ServerPayload::StageUpdate(_) => "stage_update",
            ServerPayload::TaskComplete { .. } => "task_complete",
            ServerPayload::TaskError { .. } => "task_error",
            ServerPayload::SystemAlert { .. } => "system_alert",
            ServerPayload::Pong { .. } => "pong",
            ServerPayload::StatusResponse(_) => "status_response",
            ServerPayload::Error { .. } => "error",
        }
    }
}

/// Complete outgoing frame envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(flatten)]
    pub payload: ServerPayload,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

impl ServerFrame {
    pub fn new(payload: ServerPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            message_id: short_message_id(),
        }
    }

    pub fn to_json(&self) -> Result<String, PulseError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Short opaque message id: 8 hex chars, enough to correlate within a
/// connection's recent history.
fn short_message_id() -> String {
    format!("{:08x}", fastrand::u32(..))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_frame() {
        let frame = ClientFrame::parse(
            r#"{"type":"subscribe","data":{"task_ids":["t1","t2"],"channels":["progress"]}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Subscribe(req) => {
                assert_eq!(req.task_ids, vec!["t1", "t2"]);
                assert_eq!(req.channels, vec!["progress"]);
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ping_without_data() {
        let frame = ClientFrame::parse(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping(_)));
    }

    #[test]
    fn test_unknown_type_is_validation_error() {
        let err = ClientFrame::parse(r#"{"type":"bogus","data":{}}"#).unwrap_err();
        assert!(matches!(err, PulseError::Validation(_)));
    }

    #[test]
    fn test_invalid_json_is_validation_error() {
        let err = ClientFrame::parse("not json").unwrap_err();
        assert!(matches!(err, PulseError::Validation(_)));
    }

    #[test]
    fn test_server_frame_envelope_shape() {
        let frame = ServerFrame::new(ServerPayload::Error {
            error: "boom".into(),
        });
        let json: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["error"], "boom");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["message_id"].as_str().unwrap().len(), 8);
    }

    #[test]
    fn test_droppable_classification() {
        let progress = ServerPayload::ProgressUpdate(TaskProgressData {
            task_id: "t".into(),
            status: TaskStatus::Running,
            progress: 10.0,
            current_stage: "downloading".into(),
            eta_seconds: None,
            average_speed_bps: 0.0,
            peak_speed_bps: 0.0,
            stages: BTreeMap::new(),
            updated_stage: None,
            stage_details: None,
        });
        assert!(progress.is_droppable());

        let terminal = ServerPayload::TaskComplete {
            task_id: "t".into(),
            status: TaskStatus::Completed,
            total_duration_seconds: None,
            final_progress: 100.0,
            stages_completed: 4,
        };
        assert!(!terminal.is_droppable());

        let alert = ServerPayload::SystemAlert {
            alert_type: "cpu".into(),
            message: "high".into(),
            data: Value::Null,
        };
        assert!(!alert.is_droppable());
    }

    #[test]
    fn test_channel_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("nope".parse::<Channel>().is_err());
    }
}
