//! Domain types shared across the workspace.
//!
//! Event payloads, wire frames, and alert/optimizer records are modeled as
//! tagged records with explicit enums so exhaustive handling is checked by
//! the compiler rather than by convention.

pub mod alert;
pub mod event;
pub mod frame;
pub mod metric;
pub mod optimizer;
pub mod task;

pub use alert::{
    Alert, AlertRule, AlertSeverity, AlertStatus, ChannelKind, CompareOp, EscalationPolicy,
};
pub use event::{ProgressEvent, TaskEventKind, TimelineEvent};
pub use frame::{
    Channel, ClientFrame, ConnectedData, PingData, ServerFrame, ServerPayload, StageSnapshot,
    StatusRequest, StatusResponseData, SubscriptionRequest, TaskProgressData,
};
pub use metric::{AggregateOp, MetricKind, MetricPoint};
pub use optimizer::{
    OptimizationAction, OptimizationRule, OptimizeActionKind, OptimizeCondition,
    PerformanceBaseline, StoreSample,
};
pub use task::{AggregateProgress, StageProgress, TaskKind, TaskRecord, TaskStatus};
