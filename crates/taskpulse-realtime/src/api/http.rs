//! Read API handlers. All responses are JSON; errors carry an HTTP status
//! and a `{"error": "<message>"}` body.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use taskpulse_monitoring::AckOutcome;
use taskpulse_shared::error::PulseError;
use taskpulse_shared::types::AlertSeverity;

use super::AppState;

/// Error wrapper mapping the core taxonomy onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(PulseError);

impl From<PulseError> for ApiError {
    fn from(err: PulseError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PulseError::NotFound(_) => StatusCode::NOT_FOUND,
            PulseError::Validation(_) => StatusCode::BAD_REQUEST,
            PulseError::Conflict(_) => StatusCode::CONFLICT,
            PulseError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            PulseError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn dashboard_data(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let data = state.dashboard.data().await?;
    Ok(Json(data.as_ref().clone()))
}

pub async fn dashboard_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.dashboard.summary().await?))
}

pub async fn task_details(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .engine
        .get_task(&task_id)
        .await?
        .ok_or_else(|| PulseError::NotFound(format!("task {task_id}")))?;
    let timeline = state.engine.get_timeline(&task_id, 50, 0).await?;
    let recent: Vec<_> = timeline.iter().take(10).collect();
    Ok(Json(json!({
        "task": record,
        "timeline": timeline,
        "recent_events": recent,
    })))
}

pub async fn active_tasks(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut records = Vec::new();
    for task_id in state.engine.active_task_ids().await? {
        if let Some(record) = state.engine.get_task(&task_id).await? {
            records.push(record);
        }
    }
    Ok(Json(json!({ "count": records.len(), "tasks": records })))
}

pub async fn metrics_overview(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({
        "series": state.registry.list(),
        "summary": state.registry.all_summaries(Some(3_600.0)),
    })))
}

#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    /// Window in seconds, default one hour
    pub time_window: Option<f64>,
}

pub async fn metric_detail(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<MetricQuery>,
) -> Result<Json<Value>, ApiError> {
    let window = query.time_window.unwrap_or(3_600.0);
    if window <= 0.0 {
        return Err(PulseError::Validation("time_window must be positive".into()).into());
    }
    if !state.registry.contains(&name) {
        return Err(PulseError::NotFound(format!("metric {name}")).into());
    }
    let summary = state.registry.summary(&name, Some(window));
    Ok(Json(json!({
        "metric": name,
        "time_window_seconds": window,
        "summary": summary,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub hours: Option<f64>,
    pub resolution: Option<usize>,
}

pub async fn metric_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let hours = query.hours.unwrap_or(1.0);
    let resolution = query.resolution.unwrap_or(60);
    if !(hours > 0.0 && hours <= 168.0) {
        return Err(PulseError::Validation("hours must be in (0, 168]".into()).into());
    }
    if !(1..=1_000).contains(&resolution) {
        return Err(PulseError::Validation("resolution must be in [1, 1000]".into()).into());
    }
    let history = state
        .registry
        .history(&name, hours * 3_600.0, resolution)
        .ok_or_else(|| PulseError::NotFound(format!("metric {name}")))?;
    Ok(Json(json!({
        "metric": name,
        "hours": hours,
        "resolution": resolution,
        "history": history,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
    pub level: Option<String>,
}

pub async fn alerts_list(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Value>, ApiError> {
    let severity = match query.level.as_deref() {
        None => None,
        Some("low") => Some(AlertSeverity::Low),
        Some("medium") => Some(AlertSeverity::Medium),
        Some("high") => Some(AlertSeverity::High),
        Some("critical") => Some(AlertSeverity::Critical),
        Some(other) => {
            return Err(PulseError::Validation(format!("unknown severity: {other}")).into())
        }
    };
    let alerts = state
        .alerts
        .active_alerts(query.limit.unwrap_or(50), severity)
        .await;
    Ok(Json(json!({
        "count": alerts.len(),
        "alerts": alerts,
        "statistics": state.alerts.stats().await,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeQuery {
    pub acknowledged_by: Option<String>,
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Query(query): Query<AcknowledgeQuery>,
) -> Result<Json<Value>, ApiError> {
    let by = query
        .acknowledged_by
        .ok_or_else(|| PulseError::Validation("acknowledged_by is required".into()))?;
    match state.alerts.acknowledge(&alert_id, &by).await {
        AckOutcome::Acknowledged => Ok(Json(json!({ "acknowledged": true }))),
        AckOutcome::AlreadyAcknowledged => Ok(Json(json!({
            "acknowledged": true,
            "already_acknowledged": true,
        }))),
        AckOutcome::NotFound => Err(PulseError::NotFound(format!("alert {alert_id}")).into()),
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(state.dashboard.system_health().await)
}

pub async fn refresh_dashboard(State(state): State<AppState>) -> Json<Value> {
    state.dashboard.invalidate();
    Json(json!({ "status": "refreshed" }))
}

pub async fn optimization_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.optimizer.status().await;
    Ok(Json(serde_json::to_value(status).map_err(PulseError::from)?))
}

pub async fn connection_stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(serde_json::to_value(state.hub.stats()).map_err(PulseError::from)?))
}
