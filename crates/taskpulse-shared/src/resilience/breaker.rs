//! Atomics-based circuit breaker state machine.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls pass through
    Closed,
    /// Too many failures; calls are rejected until the recovery timeout
    Open,
    /// Probing recovery; a run of successes closes the circuit again
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            // Unknown encodings map to Open, the safe side
            _ => CircuitState::Open,
        }
    }
}

impl CircuitState {
    fn encode(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time in Open before a half-open probe is allowed
    pub recovery_timeout: Duration,
    /// Successes in HalfOpen required to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Observability snapshot of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub failure_rate: f64,
}

/// Circuit breaker for one protected component
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed.encode()),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Gate the next call. Open circuits transition to HalfOpen once the
    /// recovery timeout has elapsed.
    pub fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .map(|at| at.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed >= self.config.recovery_timeout => {
                        self.transition(CircuitState::HalfOpen);
                        self.half_open_successes.store(0, Ordering::Release);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.transition(CircuitState::Closed);
                *self.opened_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
            }
        }
    }

    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed if failures >= self.config.failure_threshold => self.open(),
            // A failed probe re-opens immediately
            CircuitState::HalfOpen => self.open(),
            _ => {}
        }
    }

    /// Emergency kill switch
    pub fn force_open(&self) {
        self.open();
    }

    /// Emergency recovery
    pub fn force_closed(&self) {
        self.transition(CircuitState::Closed);
        self.consecutive_failures.store(0, Ordering::Release);
        *self.opened_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let total = self.total_calls.load(Ordering::Relaxed);
        let failures = self.failure_count.load(Ordering::Relaxed);
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.state(),
            total_calls: total,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: failures,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            failure_rate: if total > 0 {
                failures as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn open(&self) {
        *self.opened_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        let previous = self.state();
        self.transition(CircuitState::Open);
        if previous != CircuitState::Open {
            warn!(
                breaker = %self.name,
                consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed),
                "circuit breaker opened"
            );
        }
    }

    fn transition(&self, next: CircuitState) {
        let previous = CircuitState::from(self.state.swap(next.encode(), Ordering::AcqRel));
        if previous != next {
            info!(breaker = %self.name, from = ?previous, to = ?next, "circuit state transition");
        }
    }
}
