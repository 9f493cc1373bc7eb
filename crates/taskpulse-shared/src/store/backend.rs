//! Enum-dispatched store backend.
//!
//! A struct-per-backend with an enum wrapper keeps dispatch zero-cost and
//! avoids trait objects on the hot path; the in-memory variant exists so
//! unit and integration tests run against real gateway semantics without a
//! live store.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::StoreError;

use super::command::{Pipeline, SlowLogEntry};
use super::memory::MemoryBackend;
use super::redis_backend::RedisBackend;

/// The command surface the core assumes from its backing store
#[derive(Debug)]
pub enum StoreBackend {
    Redis(RedisBackend),
    InMemory(MemoryBackend),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $body:expr) => {
        match $self {
            StoreBackend::Redis($b) => $body,
            StoreBackend::InMemory($b) => $body,
        }
    };
}

impl StoreBackend {
    /// Connect to a redis-protocol store
    pub async fn connect_redis(url: &str) -> Result<Self, StoreError> {
        Ok(StoreBackend::Redis(RedisBackend::connect(url).await?))
    }

    /// In-memory backend for tests and local development
    pub fn new_in_memory() -> Self {
        StoreBackend::InMemory(MemoryBackend::new())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreBackend::Redis(_) => "redis",
            StoreBackend::InMemory(_) => "in_memory",
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        dispatch!(self, b => b.get(key).await)
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        dispatch!(self, b => b.set(key, value, ttl).await)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.delete(key).await)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        dispatch!(self, b => b.expire(key, ttl).await)
    }

    pub async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        dispatch!(self, b => b.hash_set(key, fields).await)
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        dispatch!(self, b => b.hash_get(key, field).await)
    }

    pub async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        dispatch!(self, b => b.hash_incr(key, field, by).await)
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.set_add(key, member).await)
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.set_remove(key, member).await)
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        dispatch!(self, b => b.set_members(key).await)
    }

    pub async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        dispatch!(self, b => b.set_len(key).await)
    }

    pub async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.sorted_add(key, score, member).await)
    }

    pub async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.sorted_remove(key, member).await)
    }

    /// Members by descending score
    pub async fn sorted_rev_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        dispatch!(self, b => b.sorted_rev_range(key, start, stop).await)
    }

    pub async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.list_push(key, value).await)
    }

    pub async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        dispatch!(self, b => b.list_range(key, start, stop).await)
    }

    pub async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        dispatch!(self, b => b.list_trim(key, start, stop).await)
    }

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        dispatch!(self, b => b.scan(pattern).await)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.publish(channel, payload).await)
    }

    /// Long-lived subscription; messages arrive on the returned receiver
    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        dispatch!(self, b => b.subscribe(channel).await)
    }

    pub async fn pipeline(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        dispatch!(self, b => b.pipeline(pipeline).await)
    }

    pub async fn info(&self) -> Result<HashMap<String, String>, StoreError> {
        dispatch!(self, b => b.info().await)
    }

    pub async fn config_get(&self, parameter: &str) -> Result<Option<String>, StoreError> {
        dispatch!(self, b => b.config_get(parameter).await)
    }

    pub async fn config_set(&self, parameter: &str, value: &str) -> Result<(), StoreError> {
        dispatch!(self, b => b.config_set(parameter, value).await)
    }

    pub async fn slowlog_get(&self, count: i64) -> Result<Vec<SlowLogEntry>, StoreError> {
        dispatch!(self, b => b.slowlog_get(count).await)
    }

    pub async fn memory_usage(&self, key: &str) -> Result<Option<u64>, StoreError> {
        dispatch!(self, b => b.memory_usage(key).await)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        dispatch!(self, b => b.ping().await)
    }
}
