//! # Error Taxonomy
//!
//! Two layers of errors, mirroring the propagation policy of the system:
//!
//! - [`StoreError`] classifies store failures into transient transport
//!   errors (retried by the gateway) and permanent protocol errors
//!   (surfaced immediately).
//! - [`PulseError`] is the crate-level error returned by public operations.
//!   Lookup misses are modeled as `Option`, not errors; `NotFound` exists
//!   for the HTTP boundary where a miss must become a 404.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the workspace
pub type PulseResult<T> = Result<T, PulseError>;

/// Failures raised by the store backend or the gateway wrapping it
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure; the connection to the store was lost
    #[error("store connection lost: {0}")]
    ConnectionLost(String),

    /// A single operation exceeded its timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// No connection could be checked out of the pool
    #[error("store connection pool exhausted")]
    PoolExhausted,

    /// Malformed command, wrong type, or other non-retryable protocol error
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// A transactional pipeline failed; no partial state was committed
    #[error("pipeline aborted: {0}")]
    PipelineAborted(String),

    /// The gateway's circuit breaker rejected the call
    #[error("circuit breaker open for {0}")]
    CircuitOpen(&'static str),

    /// Retries were exhausted within the total deadline
    #[error("store deadline exceeded after {attempts} attempts: {last}")]
    DeadlineExceeded { attempts: u32, last: String },
}

impl StoreError {
    /// Transient errors are retried by the gateway; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLost(_) | StoreError::Timeout(_) | StoreError::PoolExhausted
        )
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else if err.is_connection_dropped() || err.is_io_error() {
            StoreError::ConnectionLost(err.to_string())
        } else if err.is_connection_refusal() {
            StoreError::PoolExhausted
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Crate-level error for public operations
#[derive(Debug, Error)]
pub enum PulseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Duplicate task id on create, duplicate client id on connect
    #[error("conflict: {0}")]
    Conflict(String),

    /// Used at the HTTP boundary; core lookups return `Option` instead
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed frame, unknown message type, out-of-range parameter
    #[error("validation error: {0}")]
    Validation(String),

    /// Connection registry is full; maps to close code 1013 / HTTP 429
    #[error("too many connections: {0}")]
    Capacity(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Shutdown in progress; no new work is accepted
    #[error("shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for PulseError {
    fn from(err: config::ConfigError) -> Self {
        PulseError::Configuration(err.to_string())
    }
}
