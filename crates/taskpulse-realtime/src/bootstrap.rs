//! # Bootstrap
//!
//! The composition root: builds every component explicitly, wires the
//! read-only handles between them, spawns the supervised background loops,
//! and starts the HTTP server. No component is reachable through a global.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use taskpulse_monitoring::{
    AlertEngine, Notifier, NotifierConfig, PerformanceOptimizer, SystemCollector,
};
use taskpulse_progress::{CleanupSweeper, ProgressEngine};
use taskpulse_shared::config::TaskPulseConfig;
use taskpulse_shared::error::{PulseError, PulseResult};
use taskpulse_shared::metrics::MetricRegistry;
use taskpulse_shared::runtime::Supervisor;
use taskpulse_shared::store::StoreGateway;

use crate::api::{self, AppState};
use crate::auth::NullTokenValidator;
use crate::dashboard::DashboardService;
use crate::hub::{run_event_pump, FanoutHub};

/// Running system handle returned by [`Bootstrap::start`]
#[derive(Debug)]
pub struct AppHandle {
    pub config: TaskPulseConfig,
    pub hub: Arc<FanoutHub>,
    pub gateway: StoreGateway,
    pub local_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    server: Option<JoinHandle<()>>,
}

impl AppHandle {
    /// Graceful shutdown: stop accepting and close every connection with
    /// reason `server_shutdown`, cancel the background loops, drain them
    /// within the configured deadline, then release the gateway.
    pub async fn stop(mut self) -> PulseResult<()> {
        info!("shutting down");
        self.hub.shutdown();

        let stragglers = self.supervisor.shutdown(self.config.shutdown_timeout()).await;
        if stragglers > 0 {
            error!(stragglers, "background tasks aborted at shutdown deadline");
        }
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// System builder
#[derive(Debug)]
pub struct Bootstrap;

impl Bootstrap {
    /// Load configuration, connect the store, start everything.
    pub async fn start() -> PulseResult<AppHandle> {
        let config = TaskPulseConfig::load()?;
        let gateway = StoreGateway::connect(config.store.clone()).await?;
        Self::start_with_gateway(config, gateway).await
    }

    /// Start against a pre-built gateway (tests use the in-memory backend).
    pub async fn start_with_gateway(
        config: TaskPulseConfig,
        gateway: StoreGateway,
    ) -> PulseResult<AppHandle> {
        let registry = Arc::new(MetricRegistry::new(&config.metrics).with_gateway(gateway.clone()));
        let engine = Arc::new(ProgressEngine::new(gateway.clone(), config.progress.clone()));
        let hub = Arc::new(FanoutHub::new(
            config.hub.clone(),
            engine.clone(),
            Arc::new(NullTokenValidator),
        ));
        let alerts = Arc::new(AlertEngine::new(
            gateway.clone(),
            registry.clone(),
            Notifier::new(NotifierConfig::default()),
            config.alerts.clone(),
        ));
        alerts.initialize().await?;
        let optimizer = Arc::new(PerformanceOptimizer::new(
            gateway.clone(),
            config.optimizer.clone(),
        ));
        let collector = Arc::new(SystemCollector::new(gateway.clone(), registry.clone()));
        let dashboard = Arc::new(DashboardService::new(
            engine.clone(),
            registry.clone(),
            alerts.clone(),
            optimizer.clone(),
            hub.clone(),
            gateway.clone(),
            Duration::from_secs(config.http.dashboard_cache_ttl_secs),
        ));

        let supervisor = Arc::new(Supervisor::new());

        supervisor
            .spawn(
                "event_pump",
                run_event_pump(hub.clone(), gateway.clone(), supervisor.token()),
            )
            .await;

        {
            let hub = hub.clone();
            let registry = registry.clone();
            supervisor
                .spawn_interval("hub_heartbeat", config.hub.heartbeat_interval(), move || {
                    let hub = hub.clone();
                    let registry = registry.clone();
                    async move {
                        hub.heartbeat_sweep();
                        let stats = hub.stats();
                        registry
                            .record("active_connections", stats.connections.active as f64, None)
                            .await;
                        if stats.messages.sent > 0 {
                            registry
                                .record(
                                    "websocket_latency",
                                    stats.performance.average_latency_ms,
                                    None,
                                )
                                .await;
                        }
                    }
                })
                .await;
        }

        supervisor
            .spawn(
                "cleanup_sweep",
                CleanupSweeper::new(gateway.clone(), config.progress.clone())
                    .run(supervisor.token()),
            )
            .await;

        {
            let collector = collector.clone();
            supervisor
                .spawn_interval(
                    "metrics_collector",
                    Duration::from_secs(config.metrics.collection_interval_secs),
                    move || {
                        let collector = collector.clone();
                        async move { collector.collect_once().await }
                    },
                )
                .await;
        }

        {
            let alerts = alerts.clone();
            supervisor
                .spawn_interval(
                    "alert_evaluation",
                    Duration::from_secs(config.alerts.evaluation_interval_secs),
                    move || {
                        let alerts = alerts.clone();
                        async move { alerts.evaluate_all().await }
                    },
                )
                .await;
        }
        {
            let alerts = alerts.clone();
            supervisor
                .spawn_interval(
                    "alert_escalation",
                    Duration::from_secs(config.alerts.escalation_interval_secs),
                    move || {
                        let alerts = alerts.clone();
                        async move { alerts.escalation_sweep().await }
                    },
                )
                .await;
        }
        {
            let alerts = alerts.clone();
            supervisor
                .spawn_interval(
                    "alert_maintenance",
                    Duration::from_secs(config.alerts.maintenance_interval_secs),
                    move || {
                        let alerts = alerts.clone();
                        async move { alerts.maintenance_sweep().await }
                    },
                )
                .await;
        }

        {
            // Baseline first, then the tuning cycle on its interval
            let optimizer = optimizer.clone();
            let token = supervisor.token();
            let cycle = Duration::from_secs(config.optimizer.cycle_interval_secs);
            supervisor
                .spawn("optimizer_cycle", async move {
                    if let Err(e) = optimizer.establish_baseline().await {
                        error!(error = %e, "baseline establishment failed, optimizer continues without it");
                    }
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(cycle) => optimizer.run_cycle().await,
                        }
                    }
                })
                .await;
        }
        {
            let optimizer = optimizer.clone();
            supervisor
                .spawn_interval(
                    "optimizer_analysis",
                    Duration::from_secs(config.optimizer.analysis_interval_secs),
                    move || {
                        let optimizer = optimizer.clone();
                        async move { optimizer.analyze().await }
                    },
                )
                .await;
        }

        let state = AppState {
            hub: hub.clone(),
            engine,
            registry,
            alerts,
            optimizer,
            dashboard,
            gateway: gateway.clone(),
        };
        let router = api::router(state);
        let listener = tokio::net::TcpListener::bind(&config.http.bind_addr)
            .await
            .map_err(|e| PulseError::Internal(format!("bind {}: {e}", config.http.bind_addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PulseError::Internal(e.to_string()))?;

        let token = supervisor.token();
        let server = tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "http server exited with error");
            }
        });

        info!(addr = %local_addr, store = gateway.backend_name(), "taskpulse started");
        Ok(AppHandle {
            config,
            hub,
            gateway,
            local_addr,
            supervisor,
            server: Some(server),
        })
    }
}
