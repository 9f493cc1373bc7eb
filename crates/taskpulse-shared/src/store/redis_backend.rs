//! Redis implementation of the store surface.
//!
//! Commands run over a [`ConnectionManager`], which re-establishes dropped
//! connections internally; pub/sub uses a dedicated connection per
//! subscription as required by the protocol.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::StoreError;

use super::command::{Pipeline, SlowLogEntry, StoreCommand};

/// Buffered messages per subscription before the forwarder applies
/// backpressure to the pub/sub socket
const SUBSCRIPTION_BUFFER: usize = 1_024;

pub struct RedisBackend {
    client: redis::Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("addr", &self.client.get_connection_info().addr())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Protocol(format!("invalid store url: {e}")))?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().get(key).await?)
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.conn().expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    pub async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.conn().hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().hget(key, field).await?)
    }

    pub async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        Ok(self.conn().hincr(key, field, by).await?)
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.conn().sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.conn().srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().smembers(key).await?)
    }

    pub async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.conn().scard(key).await?)
    }

    pub async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.conn().zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    pub async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.conn().zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn sorted_rev_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().zrevrange(key, start as isize, stop as isize).await?)
    }

    pub async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn().lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    pub async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().lrange(key, start as isize, stop as isize).await?)
    }

    pub async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.conn()
            .ltrim::<_, ()>(key, start as isize, stop as isize)
            .await?;
        Ok(())
    }

    /// Cursor-driven SCAN so large keyspaces never block the store
    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(250)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
            // Large keyspaces: stay cooperative between cursor pages
            tokio::task::yield_now().await;
        }
        Ok(keys)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.conn().publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    debug!(channel = %channel, "subscription receiver dropped, ending forwarder");
                    break;
                }
            }
        });
        Ok(rx)
    }

    pub async fn pipeline(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        if pipeline.transactional {
            pipe.atomic();
        }
        for command in &pipeline.commands {
            match command {
                StoreCommand::Set { key, value, ttl } => match ttl {
                    Some(ttl) => {
                        pipe.set_ex(key, value, ttl.as_secs()).ignore();
                    }
                    None => {
                        pipe.set(key, value).ignore();
                    }
                },
                StoreCommand::HashSet { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                StoreCommand::HashIncr { key, field, by } => {
                    pipe.hincr(key, field, *by).ignore();
                }
                StoreCommand::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                StoreCommand::SetRemove { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                StoreCommand::SortedAdd { key, score, member } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                StoreCommand::SortedRemove { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
                StoreCommand::ListPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                StoreCommand::ListTrim { key, start, stop } => {
                    pipe.ltrim(key, *start as isize, *stop as isize).ignore();
                }
                StoreCommand::Delete { key } => {
                    pipe.del(key).ignore();
                }
                StoreCommand::Expire { key, ttl } => {
                    pipe.expire(key, ttl.as_secs() as i64).ignore();
                }
            }
        }
        let mut conn = self.conn();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::PipelineAborted(e.to_string()))?;
        Ok(())
    }

    /// INFO parsed into a flat field map
    pub async fn info(&self) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn();
        let raw: String = redis::cmd("INFO").query_async(&mut conn).await?;
        let mut fields = HashMap::new();
        for line in raw.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(fields)
    }

    pub async fn config_get(&self, parameter: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let pair: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(parameter)
            .query_async(&mut conn)
            .await?;
        Ok(pair.into_iter().nth(1))
    }

    pub async fn config_set(&self, parameter: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("CONFIG")
            .arg("SET")
            .arg(parameter)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn slowlog_get(&self, count: i64) -> Result<Vec<SlowLogEntry>, StoreError> {
        let mut conn = self.conn();
        let raw: redis::Value = redis::cmd("SLOWLOG")
            .arg("GET")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(parse_slowlog(raw))
    }

    pub async fn memory_usage(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn();
        let usage: Option<u64> = redis::cmd("MEMORY")
            .arg("USAGE")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(usage)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// SLOWLOG entries arrive as nested arrays; newer server versions append
/// extra fields, so only the leading four are read.
fn parse_slowlog(value: redis::Value) -> Vec<SlowLogEntry> {
    let redis::Value::Array(entries) = value else {
        return Vec::new();
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let redis::Value::Array(fields) = entry else {
                return None;
            };
            let mut it = fields.into_iter();
            let id = as_int(it.next()?)?;
            let timestamp = as_int(it.next()?)?;
            let duration_us = as_int(it.next()?)?;
            let command = match it.next()? {
                redis::Value::Array(args) => args
                    .into_iter()
                    .filter_map(as_text)
                    .collect::<Vec<_>>()
                    .join(" "),
                other => as_text(other)?,
            };
            Some(SlowLogEntry {
                id,
                timestamp,
                duration_us,
                command,
            })
        })
        .collect()
}

fn as_int(value: redis::Value) -> Option<i64> {
    match value {
        redis::Value::Int(v) => Some(v),
        _ => None,
    }
}

fn as_text(value: redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes).ok(),
        redis::Value::SimpleString(s) => Some(s),
        _ => None,
    }
}
