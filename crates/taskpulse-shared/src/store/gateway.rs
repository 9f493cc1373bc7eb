//! # Store Gateway
//!
//! The single entry point for durable state. Wraps the backend with:
//!
//! - bounded retry (transient errors only) with exponential backoff + jitter
//! - a per-operation timeout and a total deadline including retries
//! - optional circuit-breaker protection; `ping`/`health_check` bypass the
//!   breaker so observability keeps working while the circuit is open
//! - health probing with `Healthy | Degraded | Unhealthy` classification

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

use super::backend::StoreBackend;
use super::command::{Pipeline, SlowLogEntry};

/// Probe failures before a degraded store is reported unhealthy
const UNHEALTHY_PROBE_THRESHOLD: u32 = 3;

/// Health classification returned by [`StoreGateway::health_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// A single probe failure; the store may recover on its own
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub state: HealthState,
    pub round_trip_ms: f64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Typed adapter over the store backend with retry and resilience policy
#[derive(Debug, Clone)]
pub struct StoreGateway {
    backend: Arc<StoreBackend>,
    config: StoreConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    probe_failures: Arc<AtomicU32>,
}

impl StoreGateway {
    pub fn new(backend: StoreBackend, config: StoreConfig) -> Self {
        let breaker = config.circuit_breaker_enabled.then(|| {
            Arc::new(CircuitBreaker::new(
                "store",
                CircuitBreakerConfig {
                    failure_threshold: config.failure_threshold,
                    recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
                    success_threshold: config.success_threshold,
                },
            ))
        });
        Self {
            backend: Arc::new(backend),
            config,
            breaker,
            probe_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Connect to the configured store url
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        let backend = StoreBackend::connect_redis(&config.url).await?;
        Ok(Self::new(backend, config))
    }

    /// In-memory gateway for tests and local runs
    pub fn in_memory() -> Self {
        Self::new(StoreBackend::new_in_memory(), StoreConfig::default())
    }

    pub fn backend(&self) -> &Arc<StoreBackend> {
        &self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    // =========================================================================
    // Retry core
    // =========================================================================

    /// Run one backend operation under the full policy: breaker gate,
    /// per-attempt timeout, transient-only retry, total deadline.
    async fn call<T, F, Fut>(&self, op_name: &'static str, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if let Some(cb) = &self.breaker {
            if !cb.should_allow() {
                return Err(StoreError::CircuitOpen("store"));
            }
        }
        let result = self.retry_loop(op_name, op).await;
        if let Some(cb) = &self.breaker {
            match &result {
                Ok(_) => cb.record_success(),
                Err(e) if e.is_transient() || matches!(e, StoreError::DeadlineExceeded { .. }) => {
                    cb.record_failure()
                }
                // Protocol errors say nothing about store availability
                Err(_) => {}
            }
        }
        result
    }

    async fn retry_loop<T, F, Fut>(&self, op_name: &'static str, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let deadline = self.config.total_deadline();
        let op_timeout = self.config.operation_timeout();
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(op_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(op_timeout)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt >= self.config.max_retries {
                        return Err(StoreError::DeadlineExceeded {
                            attempts: attempt,
                            last: last_error,
                        });
                    }
                    // Exponential backoff with jitter to avoid retry herds
                    let base = self.config.retry_base_delay().as_millis() as u64;
                    let backoff = base.saturating_mul(1 << (attempt - 1));
                    let delay = Duration::from_millis(backoff + fastrand::u64(0..=base));
                    if started.elapsed() + delay >= deadline {
                        return Err(StoreError::DeadlineExceeded {
                            attempts: attempt,
                            last: last_error,
                        });
                    }
                    debug!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "retrying transient store failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // =========================================================================
    // Command surface (PROTECTED)
    // =========================================================================

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("get", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.get(&key).await }
        })
        .await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let (b, key, value) = (self.backend.clone(), key.to_string(), value.to_string());
        self.call("set", move || {
            let (b, key, value) = (b.clone(), key.clone(), value.clone());
            async move { b.set(&key, &value, ttl).await }
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("delete", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.delete(&key).await }
        })
        .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("expire", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.expire(&key, ttl).await }
        })
        .await
    }

    pub async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        let (b, key, fields) = (self.backend.clone(), key.to_string(), fields);
        self.call("hash_set", move || {
            let (b, key, fields) = (b.clone(), key.clone(), fields.clone());
            async move { b.hash_set(&key, &fields).await }
        })
        .await
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let (b, key, field) = (self.backend.clone(), key.to_string(), field.to_string());
        self.call("hash_get", move || {
            let (b, key, field) = (b.clone(), key.clone(), field.clone());
            async move { b.hash_get(&key, &field).await }
        })
        .await
    }

    pub async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let (b, key, field) = (self.backend.clone(), key.to_string(), field.to_string());
        self.call("hash_incr", move || {
            let (b, key, field) = (b.clone(), key.clone(), field.clone());
            async move { b.hash_incr(&key, &field, by).await }
        })
        .await
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let (b, key, member) = (self.backend.clone(), key.to_string(), member.to_string());
        self.call("set_add", move || {
            let (b, key, member) = (b.clone(), key.clone(), member.clone());
            async move { b.set_add(&key, &member).await }
        })
        .await
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let (b, key, member) = (self.backend.clone(), key.to_string(), member.to_string());
        self.call("set_remove", move || {
            let (b, key, member) = (b.clone(), key.clone(), member.clone());
            async move { b.set_remove(&key, &member).await }
        })
        .await
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("set_members", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.set_members(&key).await }
        })
        .await
    }

    pub async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("set_len", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.set_len(&key).await }
        })
        .await
    }

    pub async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let (b, key, member) = (self.backend.clone(), key.to_string(), member.to_string());
        self.call("sorted_add", move || {
            let (b, key, member) = (b.clone(), key.clone(), member.clone());
            async move { b.sorted_add(&key, score, &member).await }
        })
        .await
    }

    pub async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let (b, key, member) = (self.backend.clone(), key.to_string(), member.to_string());
        self.call("sorted_remove", move || {
            let (b, key, member) = (b.clone(), key.clone(), member.clone());
            async move { b.sorted_remove(&key, &member).await }
        })
        .await
    }

    pub async fn sorted_rev_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("sorted_rev_range", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.sorted_rev_range(&key, start, stop).await }
        })
        .await
    }

    pub async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (b, key, value) = (self.backend.clone(), key.to_string(), value.to_string());
        self.call("list_push", move || {
            let (b, key, value) = (b.clone(), key.clone(), value.clone());
            async move { b.list_push(&key, &value).await }
        })
        .await
    }

    pub async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("list_range", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.list_range(&key, start, stop).await }
        })
        .await
    }

    pub async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("list_trim", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.list_trim(&key, start, stop).await }
        })
        .await
    }

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let (b, pattern) = (self.backend.clone(), pattern.to_string());
        self.call("scan", move || {
            let (b, pattern) = (b.clone(), pattern.clone());
            async move { b.scan(&pattern).await }
        })
        .await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let (b, channel, payload) = (
            self.backend.clone(),
            channel.to_string(),
            payload.to_string(),
        );
        self.call("publish", move || {
            let (b, channel, payload) = (b.clone(), channel.clone(), payload.clone());
            async move { b.publish(&channel, &payload).await }
        })
        .await
    }

    /// Execute a pipeline. Transactional pipelines commit all-or-nothing;
    /// a failure surfaces as [`StoreError::PipelineAborted`] with no state
    /// mutation observable to readers.
    pub async fn pipeline(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        let b = self.backend.clone();
        self.call("pipeline", move || {
            let (b, pipeline) = (b.clone(), pipeline.clone());
            async move { b.pipeline(pipeline).await }
        })
        .await
    }

    pub async fn info(&self) -> Result<HashMap<String, String>, StoreError> {
        let b = self.backend.clone();
        self.call("info", move || {
            let b = b.clone();
            async move { b.info().await }
        })
        .await
    }

    pub async fn config_get(&self, parameter: &str) -> Result<Option<String>, StoreError> {
        let (b, parameter) = (self.backend.clone(), parameter.to_string());
        self.call("config_get", move || {
            let (b, parameter) = (b.clone(), parameter.clone());
            async move { b.config_get(&parameter).await }
        })
        .await
    }

    pub async fn config_set(&self, parameter: &str, value: &str) -> Result<(), StoreError> {
        let (b, parameter, value) = (
            self.backend.clone(),
            parameter.to_string(),
            value.to_string(),
        );
        self.call("config_set", move || {
            let (b, parameter, value) = (b.clone(), parameter.clone(), value.clone());
            async move { b.config_set(&parameter, &value).await }
        })
        .await
    }

    pub async fn slowlog_get(&self, count: i64) -> Result<Vec<SlowLogEntry>, StoreError> {
        let b = self.backend.clone();
        self.call("slowlog_get", move || {
            let b = b.clone();
            async move { b.slowlog_get(count).await }
        })
        .await
    }

    pub async fn memory_usage(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let (b, key) = (self.backend.clone(), key.to_string());
        self.call("memory_usage", move || {
            let (b, key) = (b.clone(), key.clone());
            async move { b.memory_usage(&key).await }
        })
        .await
    }

    // =========================================================================
    // Subscription and health (UNPROTECTED)
    // =========================================================================

    /// Long-lived subscription; not retried, callers resubscribe on their
    /// own cadence when the receiver closes.
    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        self.backend.subscribe(channel).await
    }

    /// Single probe with RTT measurement. Bypasses the circuit breaker so
    /// health stays observable while the breaker is open. One failure only
    /// degrades; repeated failures report unhealthy.
    pub async fn health_check(&self) -> StoreHealth {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.operation_timeout(), self.backend.ping()).await;
        let round_trip_ms = started.elapsed().as_secs_f64() * 1_000.0;

        match outcome {
            Ok(Ok(())) => {
                self.probe_failures.store(0, Ordering::Release);
                StoreHealth {
                    state: HealthState::Healthy,
                    round_trip_ms,
                    consecutive_failures: 0,
                    error: None,
                }
            }
            Ok(Err(e)) => self.failed_probe(round_trip_ms, e.to_string()),
            Err(_) => self.failed_probe(
                round_trip_ms,
                format!(
                    "health probe timed out after {}ms",
                    self.config.operation_timeout_ms
                ),
            ),
        }
    }

    fn failed_probe(&self, round_trip_ms: f64, error: String) -> StoreHealth {
        let failures = self.probe_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let state = if failures >= UNHEALTHY_PROBE_THRESHOLD {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };
        warn!(failures, error = %error, "store health probe failed");
        StoreHealth {
            state,
            round_trip_ms,
            consecutive_failures: failures,
            error: Some(error),
        }
    }
}
