//! HTTP surface: read API, WebSocket upgrade, and the one-way event stream.

mod http;
mod sse;
mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use taskpulse_monitoring::{AlertEngine, PerformanceOptimizer};
use taskpulse_progress::ProgressEngine;
use taskpulse_shared::metrics::MetricRegistry;
use taskpulse_shared::store::StoreGateway;

use crate::dashboard::DashboardService;
use crate::hub::FanoutHub;

pub use http::ApiError;

/// Shared handles for all request handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub hub: Arc<FanoutHub>,
    pub engine: Arc<ProgressEngine>,
    pub registry: Arc<MetricRegistry>,
    pub alerts: Arc<AlertEngine>,
    pub optimizer: Arc<PerformanceOptimizer>,
    pub dashboard: Arc<DashboardService>,
    pub gateway: StoreGateway,
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/data", get(http::dashboard_data))
        .route("/summary", get(http::dashboard_summary))
        .route("/tasks/{id}/details", get(http::task_details))
        .route("/tasks/active", get(http::active_tasks))
        .route("/metrics", get(http::metrics_overview))
        .route("/metrics/{name}", get(http::metric_detail))
        .route("/metrics/{name}/history", get(http::metric_history))
        .route("/alerts", get(http::alerts_list))
        .route("/alerts/{id}/acknowledge", post(http::acknowledge_alert))
        .route("/health", get(http::health))
        .route("/refresh", post(http::refresh_dashboard))
        .route("/optimization/status", get(http::optimization_status))
        .route("/stats/connections", get(http::connection_stats))
        .route("/ws/progress", get(ws::ws_handler))
        .route("/stream", get(sse::sse_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
