//! # Store Gateway
//!
//! Uniform, typed access to the key-value + pub/sub + sorted-set backend.
//! Backends are enum-dispatched ([`StoreBackend`]): the redis variant for
//! deployment, an in-memory variant backing tests. The [`StoreGateway`]
//! layers retry, timeouts, a total deadline, and circuit-breaker protection
//! on top.

mod backend;
mod command;
mod gateway;
mod keys;
mod memory;
mod redis_backend;

pub use backend::StoreBackend;
pub use command::{Pipeline, SlowLogEntry, StoreCommand};
pub use gateway::{HealthState, StoreGateway, StoreHealth};
pub use keys::*;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
