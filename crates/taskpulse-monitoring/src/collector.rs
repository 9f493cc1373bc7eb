//! # System & Application Metrics Collector
//!
//! Samples the host (CPU, memory), the store (INFO fields, probe latency),
//! and application counters into the metric series registry, then persists
//! a whole-registry snapshot for cross-process dashboards.

use std::sync::Arc;
use std::sync::Mutex;

use sysinfo::System;
use tracing::debug;

use taskpulse_shared::metrics::MetricRegistry;
use taskpulse_shared::store::{StoreGateway, ACTIVE_TASKS_KEY};

/// Periodic sampler feeding the metric registry
#[derive(Debug)]
pub struct SystemCollector {
    gateway: StoreGateway,
    registry: Arc<MetricRegistry>,
    system: Mutex<System>,
}

impl SystemCollector {
    pub fn new(gateway: StoreGateway, registry: Arc<MetricRegistry>) -> Self {
        Self {
            gateway,
            registry,
            system: Mutex::new(System::new()),
        }
    }

    /// One collection pass; individual source failures are logged and the
    /// remaining sources still sample.
    pub async fn collect_once(&self) {
        self.collect_host().await;
        self.collect_store().await;
        self.collect_application().await;
        self.registry.persist_snapshot().await;
    }

    async fn collect_host(&self) {
        let (cpu, memory_mb, memory_percent) = {
            let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
            system.refresh_cpu_usage();
            system.refresh_memory();
            let total = system.total_memory();
            let used = system.used_memory();
            (
                system.global_cpu_usage() as f64,
                used as f64 / (1024.0 * 1024.0),
                if total > 0 {
                    used as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            )
        };
        self.registry.record("cpu_usage", cpu, None).await;
        self.registry.record("memory_usage", memory_mb, None).await;
        self.registry
            .record("memory_usage_percent", memory_percent, None)
            .await;
    }

    async fn collect_store(&self) {
        let health = self.gateway.health_check().await;
        self.registry
            .record("store_latency_ms", health.round_trip_ms, None)
            .await;

        let info = match self.gateway.info().await {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "store info unavailable, skipping store metrics");
                return;
            }
        };

        let field = |name: &str| info.get(name).and_then(|v| v.parse::<f64>().ok());

        if let Some(ops) = field("instantaneous_ops_per_sec") {
            self.registry.record("store_ops_per_sec", ops, None).await;
        }
        if let Some(clients) = field("connected_clients") {
            self.registry
                .record("store_connected_clients", clients, None)
                .await;
        }

        let hits = field("keyspace_hits").unwrap_or(0.0);
        let misses = field("keyspace_misses").unwrap_or(0.0);
        let hit_rate = if hits + misses > 0.0 {
            hits / (hits + misses)
        } else {
            1.0
        };
        self.registry.record("store_hit_rate", hit_rate, None).await;

        let used = field("used_memory").unwrap_or(0.0);
        let max = field("maxmemory").unwrap_or(0.0);
        let used_percent = if max > 0.0 { used / max } else { 0.0 };
        self.registry
            .record("store_memory_used_percent", used_percent, None)
            .await;
    }

    async fn collect_application(&self) {
        match self.gateway.set_len(ACTIVE_TASKS_KEY).await {
            Ok(count) => self.registry.record("active_tasks", count as f64, None).await,
            Err(e) => debug!(error = %e, "active task count unavailable"),
        }
    }
}
