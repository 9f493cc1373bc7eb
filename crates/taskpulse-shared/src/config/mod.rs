//! # Configuration
//!
//! Typed per-component configuration with serde defaults, loaded from an
//! optional `config/taskpulse` file and `TASKPULSE_`-prefixed environment
//! variables (double-underscore path separator, e.g.
//! `TASKPULSE_HUB__MAX_CONNECTIONS=2000`).
//!
//! Components receive their own section at construction; nothing reads
//! configuration through a global.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PulseResult;

/// Top-level configuration for the whole system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPulseConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub alerts: AlertEngineConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl TaskPulseConfig {
    /// Load from `config/taskpulse.{toml,yaml,json}` (optional) with
    /// environment overrides.
    pub fn load() -> PulseResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/taskpulse").required(false))
            .add_source(config::Environment::with_prefix("TASKPULSE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Store gateway settings: connection, retry envelope, circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    /// Attempts per operation, transient failures only
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Per-operation timeout
    pub operation_timeout_ms: u64,
    /// Total deadline including all retries
    pub total_deadline_ms: u64,
    pub circuit_breaker_enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            max_retries: 3,
            retry_base_delay_ms: 50,
            operation_timeout_ms: 5_000,
            total_deadline_ms: 15_000,
            circuit_breaker_enabled: true,
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            success_threshold: 2,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn total_deadline(&self) -> Duration {
        Duration::from_millis(self.total_deadline_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Progress engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Timeline entries kept per task, oldest discarded
    pub max_events_per_task: usize,
    pub cleanup_interval_hours: u64,
    /// Terminal tasks older than this are swept
    pub completed_task_ttl_days: i64,
    /// Task record TTL at creation
    pub task_ttl_days: u64,
    /// Moving-average window for rate estimation
    pub rate_window_samples: usize,
    /// Timeline appends for stage_progress are sampled above this rate
    pub timeline_sample_rate_per_sec: u32,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_events_per_task: 1_000,
            cleanup_interval_hours: 24,
            completed_task_ttl_days: 7,
            task_ttl_days: 30,
            rate_window_samples: 5,
            timeline_sample_rate_per_sec: 10,
        }
    }
}

/// Fan-out hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    /// Per-connection mailbox bound before droppable frames are shed
    pub send_buffer_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1_000,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 120,
            send_buffer_limit: 100,
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Metric series store + collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub series_capacity: usize,
    /// TTL for persisted series/snapshot keys
    pub durability_ttl_secs: u64,
    pub collection_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            series_capacity: 1_000,
            durability_ttl_secs: 24 * 3_600,
            collection_interval_secs: 5,
        }
    }
}

/// Alert engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertEngineConfig {
    pub evaluation_interval_secs: u64,
    pub escalation_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub history_capacity: usize,
    pub history_retention_days: i64,
    /// Active alerts older than this are auto-resolved as stale
    pub stale_alert_hours: i64,
    pub default_suppression_minutes: u64,
}

impl Default for AlertEngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 30,
            escalation_interval_secs: 60,
            maintenance_interval_secs: 300,
            history_capacity: 10_000,
            history_retention_days: 30,
            stale_alert_hours: 24,
            default_suppression_minutes: 60,
        }
    }
}

/// Performance optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub cycle_interval_secs: u64,
    pub sample_interval_secs: u64,
    pub analysis_interval_secs: u64,
    /// Delay between applying an action and measuring its impact
    pub impact_delay_secs: u64,
    pub baseline_samples: usize,
    pub baseline_sample_gap_ms: u64,
    /// Only actions younger than this are rollback candidates
    pub rollback_window_secs: i64,
    pub history_capacity: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 300,
            sample_interval_secs: 60,
            analysis_interval_secs: 600,
            impact_delay_secs: 30,
            baseline_samples: 5,
            baseline_sample_gap_ms: 2_000,
            rollback_window_secs: 1_800,
            history_capacity: 1_000,
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub dashboard_cache_ttl_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8090".to_string(),
            dashboard_cache_ttl_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = TaskPulseConfig::default();
        assert_eq!(cfg.store.max_retries, 3);
        assert_eq!(cfg.store.operation_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.store.total_deadline(), Duration::from_secs(15));
        assert_eq!(cfg.progress.max_events_per_task, 1_000);
        assert_eq!(cfg.progress.completed_task_ttl_days, 7);
        assert_eq!(cfg.progress.cleanup_interval_hours, 24);
        assert_eq!(cfg.hub.max_connections, 1_000);
        assert_eq!(cfg.hub.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.hub.client_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.metrics.series_capacity, 1_000);
        assert_eq!(cfg.alerts.evaluation_interval_secs, 30);
        assert_eq!(cfg.optimizer.cycle_interval_secs, 300);
        assert_eq!(cfg.shutdown_timeout_ms, 10_000);
    }

    #[test]
    fn test_empty_sources_deserialize_to_defaults() {
        let cfg: TaskPulseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.store.url, "redis://127.0.0.1:6379/0");
        assert_eq!(cfg.progress.rate_window_samples, 5);
    }
}
