//! # Dashboard Composite
//!
//! Assembles the `GET /data` payload (summary, active tasks, recent
//! completions, metrics, alerts, health, uptime) from the component
//! handles. The composite is cached with a short TTL; `POST /refresh`
//! invalidates the cache.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::{json, Value};
use tracing::warn;

use taskpulse_monitoring::{AlertEngine, PerformanceOptimizer};
use taskpulse_progress::ProgressEngine;
use taskpulse_shared::error::PulseResult;
use taskpulse_shared::metrics::MetricRegistry;
use taskpulse_shared::store::{HealthState, StoreGateway, COMPLETED_TASKS_KEY};

use crate::hub::FanoutHub;

const DATA_KEY: &str = "data";
const RECENT_COMPLETIONS: i64 = 10;

/// Read-side aggregation over all components
pub struct DashboardService {
    engine: Arc<ProgressEngine>,
    registry: Arc<MetricRegistry>,
    alerts: Arc<AlertEngine>,
    optimizer: Arc<PerformanceOptimizer>,
    hub: Arc<FanoutHub>,
    gateway: StoreGateway,
    cache: Cache<&'static str, Arc<Value>>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

impl std::fmt::Debug for DashboardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardService")
            .field("started_wall", &self.started_wall)
            .finish_non_exhaustive()
    }
}

impl DashboardService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<ProgressEngine>,
        registry: Arc<MetricRegistry>,
        alerts: Arc<AlertEngine>,
        optimizer: Arc<PerformanceOptimizer>,
        hub: Arc<FanoutHub>,
        gateway: StoreGateway,
        cache_ttl: std::time::Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            alerts,
            optimizer,
            hub,
            gateway,
            cache: Cache::builder().time_to_live(cache_ttl).max_capacity(8).build(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
        }
    }

    /// Full dashboard composite, served from the TTL cache
    pub async fn data(&self) -> PulseResult<Arc<Value>> {
        if let Some(cached) = self.cache.get(DATA_KEY).await {
            return Ok(cached);
        }
        let fresh = Arc::new(self.build_data().await?);
        self.cache.insert(DATA_KEY, fresh.clone()).await;
        Ok(fresh)
    }

    /// Executive summary for `GET /summary`
    pub async fn summary(&self) -> PulseResult<Value> {
        let stats = self.engine.statistics().await?;
        let hub_stats = self.hub.stats();
        let alert_stats = self.alerts.stats().await;
        let health = self.system_health().await;

        Ok(json!({
            "timestamp": Utc::now(),
            "active_tasks": stats.active_tasks,
            "tasks_by_status": stats.tasks_by_status,
            "active_connections": hub_stats.connections.active,
            "active_alerts": alert_stats.active_count,
            "average_send_latency_ms": hub_stats.performance.average_latency_ms,
            "overall_status": health["overall"],
            "uptime_seconds": self.started_at.elapsed().as_secs(),
        }))
    }

    /// Component health roll-up for `GET /health`
    pub async fn system_health(&self) -> Value {
        let store = self.gateway.health_check().await;
        let hub_accepting = self.hub.is_accepting();
        let overall = match store.state {
            HealthState::Unhealthy => "unhealthy",
            HealthState::Degraded => "degraded",
            HealthState::Healthy if hub_accepting => "healthy",
            HealthState::Healthy => "shutting_down",
        };
        json!({
            "overall": overall,
            "components": {
                "store": store,
                "fanout_hub": {
                    "accepting": hub_accepting,
                    "active_connections": self.hub.active_connections(),
                },
            },
            "checked_at": Utc::now(),
        })
    }

    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }

    async fn build_data(&self) -> PulseResult<Value> {
        let stats = self.engine.statistics().await?;

        let mut active_tasks = Vec::new();
        for task_id in self.engine.active_task_ids().await? {
            if let Some(record) = self.engine.get_task(&task_id).await? {
                active_tasks.push(serde_json::to_value(&record)?);
            }
        }

        let mut recent_completions = Vec::new();
        let completed_ids = self
            .gateway
            .sorted_rev_range(COMPLETED_TASKS_KEY, 0, RECENT_COMPLETIONS - 1)
            .await?;
        for task_id in completed_ids {
            match self.engine.get_task(&task_id).await {
                Ok(Some(record)) => recent_completions.push(serde_json::to_value(&record)?),
                Ok(None) => {}
                Err(e) => warn!(task_id, error = %e, "recent completion resolution failed"),
            }
        }

        let alerts = self.alerts.active_alerts(20, None).await;
        let optimizer = self.optimizer.status().await;

        Ok(json!({
            "timestamp": Utc::now(),
            "summary": {
                "tasks_by_status": stats.tasks_by_status,
                "tasks_by_kind": stats.tasks_by_kind,
                "active_tasks": stats.active_tasks,
                "total_events": stats.total_events,
            },
            "active_tasks": active_tasks,
            "recent_completions": recent_completions,
            "metrics": self.registry.all_summaries(Some(3_600.0)),
            "alerts": {
                "active": alerts,
                "statistics": self.alerts.stats().await,
            },
            "system_health": self.system_health().await,
            "optimizer": {
                "total_optimizations": optimizer.total_optimizations,
                "rollbacks_performed": optimizer.rollbacks_performed,
            },
            "connections": self.hub.stats(),
            "uptime": {
                "started_at": self.started_wall,
                "uptime_seconds": self.started_at.elapsed().as_secs(),
            },
        }))
    }
}
