//! # Resilience
//!
//! Circuit breaker protecting the store gateway. The breaker trips after
//! repeated transport failures so callers fail fast instead of stacking
//! retries onto an unhealthy store, and recovers through a half-open probe
//! phase gated by a success threshold.

mod breaker;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitSnapshot};
