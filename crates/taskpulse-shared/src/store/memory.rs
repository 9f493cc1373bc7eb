//! In-memory store backend.
//!
//! Implements the full command surface over process-local maps so tests and
//! local development exercise real gateway semantics. Pipelines apply under
//! a single lock, which makes transactional batches trivially atomic.
//! Expiry is lazy: keys past their deadline are purged on access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::StoreError;

use super::command::{Pipeline, SlowLogEntry, StoreCommand};

const PUBSUB_BUFFER: usize = 1_024;

#[derive(Debug, Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    sorted: HashMap<String, Vec<(f64, String)>>,
    lists: HashMap<String, VecDeque<String>>,
    expiries: HashMap<String, Instant>,
    config: HashMap<String, String>,
    info: HashMap<String, String>,
}

impl MemoryState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove_key(&key);
        }
    }

    fn remove_key(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.sorted.remove(key);
        self.lists.remove(key);
        self.expiries.remove(key);
    }

    fn apply(&mut self, command: &StoreCommand) {
        match command {
            StoreCommand::Set { key, value, ttl } => {
                self.strings.insert(key.clone(), value.clone());
                if let Some(ttl) = ttl {
                    self.expiries.insert(key.clone(), Instant::now() + *ttl);
                }
            }
            StoreCommand::HashSet { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            StoreCommand::HashIncr { key, field, by } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                let current: i64 = hash
                    .get(field)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default();
                hash.insert(field.clone(), (current + by).to_string());
            }
            StoreCommand::SetAdd { key, member } => {
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            StoreCommand::SetRemove { key, member } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                }
            }
            StoreCommand::SortedAdd { key, score, member } => {
                let entries = self.sorted.entry(key.clone()).or_default();
                entries.retain(|(_, m)| m != member);
                entries.push((*score, member.clone()));
                entries.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            }
            StoreCommand::SortedRemove { key, member } => {
                if let Some(entries) = self.sorted.get_mut(key) {
                    entries.retain(|(_, m)| m != member);
                }
            }
            StoreCommand::ListPush { key, value } => {
                self.lists.entry(key.clone()).or_default().push_front(value.clone());
            }
            StoreCommand::ListTrim { key, start, stop } => {
                if let Some(list) = self.lists.get_mut(key) {
                    trim_list(list, *start, *stop);
                }
            }
            StoreCommand::Delete { key } => {
                self.remove_key(key);
            }
            StoreCommand::Expire { key, ttl } => {
                self.expiries.insert(key.clone(), Instant::now() + *ttl);
            }
        }
    }
}

fn trim_list(list: &mut VecDeque<String>, start: i64, stop: i64) {
    let len = list.len() as i64;
    let normalize = |idx: i64| -> i64 {
        if idx < 0 {
            (len + idx).max(0)
        } else {
            idx
        }
    };
    let start = normalize(start);
    let stop = normalize(stop).min(len - 1);
    if start > stop || len == 0 {
        list.clear();
        return;
    }
    let kept: VecDeque<String> = list
        .iter()
        .skip(start as usize)
        .take((stop - start + 1) as usize)
        .cloned()
        .collect();
    *list = kept;
}

/// Process-local backend with redis-equivalent semantics
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut info = HashMap::new();
        // Plausible idle-instance figures; tests overwrite what they assert on
        info.insert("used_memory".into(), "1048576".into());
        info.insert("maxmemory".into(), "0".into());
        info.insert("keyspace_hits".into(), "1000".into());
        info.insert("keyspace_misses".into(), "50".into());
        info.insert("connected_clients".into(), "4".into());
        info.insert("instantaneous_ops_per_sec".into(), "120".into());
        info.insert("evicted_keys".into(), "0".into());
        info.insert("expired_keys".into(), "0".into());
        info.insert("mem_fragmentation_ratio".into(), "1.1".into());

        let mut config = HashMap::new();
        config.insert("maxmemory-policy".into(), "noeviction".into());
        config.insert("timeout".into(), "0".into());
        config.insert("maxclients".into(), "10000".into());
        config.insert("save".into(), "3600 1 300 100 60 10000".into());
        config.insert("rdbcompression".into(), "yes".into());

        Self {
            state: Mutex::new(MemoryState {
                config,
                info,
                ..Default::default()
            }),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.purge_expired();
        state
    }

    /// Override an INFO field; used by tests to steer optimizer/health paths
    pub fn set_info_field(&self, field: &str, value: &str) {
        self.lock().info.insert(field.into(), value.into());
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().strings.get(key).cloned())
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove_key(key);
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::Expire {
            key: key.into(),
            ttl,
        });
        Ok(())
    }

    pub async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::HashSet {
            key: key.into(),
            fields: fields.to_vec(),
        });
        Ok(())
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    pub async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut state = self.lock();
        state.apply(&StoreCommand::HashIncr {
            key: key.into(),
            field: field.into(),
            by,
        });
        Ok(state
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .and_then(|v| v.parse().ok())
            .unwrap_or_default())
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        Ok(())
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.lock().sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    pub async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::SortedAdd {
            key: key.into(),
            score,
            member: member.into(),
        });
        Ok(())
    }

    pub async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::SortedRemove {
            key: key.into(),
            member: member.into(),
        });
        Ok(())
    }

    pub async fn sorted_rev_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let Some(entries) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let len = entries.len() as i64;
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }
        Ok(entries
            .iter()
            .rev()
            .skip(start.max(0) as usize)
            .take((stop - start.max(0) + 1) as usize)
            .map(|(_, member)| member.clone())
            .collect())
    }

    pub async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::ListPush {
            key: key.into(),
            value: value.into(),
        });
        Ok(())
    }

    pub async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let normalize = |idx: i64| if idx < 0 { (len + idx).max(0) } else { idx };
        let start = normalize(start);
        let stop = normalize(stop).min(len - 1);
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    pub async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.lock().apply(&StoreCommand::ListTrim {
            key: key.into(),
            start,
            stop,
        });
        Ok(())
    }

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let matcher = GlobMatcher::new(pattern);
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.hashes.keys())
            .chain(state.sets.keys())
            .chain(state.sorted.keys())
            .chain(state.lists.keys())
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(sender) = channels.get(channel) {
            // No subscribers is not an error, matching pub/sub semantics
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut rx = {
            let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(PUBSUB_BUFFER).0)
                .subscribe()
        };
        let (tx, out) = mpsc::channel(PUBSUB_BUFFER);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "in-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }

    pub async fn pipeline(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        let mut state = self.lock();
        for command in &pipeline.commands {
            state.apply(command);
        }
        Ok(())
    }

    pub async fn info(&self) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.lock().info.clone())
    }

    pub async fn config_get(&self, parameter: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().config.get(parameter).cloned())
    }

    pub async fn config_set(&self, parameter: &str, value: &str) -> Result<(), StoreError> {
        self.lock().config.insert(parameter.into(), value.into());
        Ok(())
    }

    pub async fn slowlog_get(&self, _count: i64) -> Result<Vec<SlowLogEntry>, StoreError> {
        Ok(Vec::new())
    }

    pub async fn memory_usage(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let state = self.lock();
        let size = state
            .strings
            .get(key)
            .map(|v| v.len() as u64)
            .or_else(|| {
                state
                    .hashes
                    .get(key)
                    .map(|h| h.values().map(|v| v.len() as u64).sum())
            })
            .or_else(|| {
                state
                    .lists
                    .get(key)
                    .map(|l| l.iter().map(|v| v.len() as u64).sum())
            });
        Ok(size)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal glob support: `*` wildcards, as used by the key layout patterns
struct GlobMatcher {
    parts: Vec<String>,
    leading_wildcard: bool,
    trailing_wildcard: bool,
}

impl GlobMatcher {
    fn new(pattern: &str) -> Self {
        Self {
            parts: pattern.split('*').map(str::to_string).collect(),
            leading_wildcard: pattern.starts_with('*'),
            trailing_wildcard: pattern.ends_with('*'),
        }
    }

    fn matches(&self, text: &str) -> bool {
        let mut remainder = text;
        for (i, part) in self.parts.iter().filter(|p| !p.is_empty()).enumerate() {
            let first_literal = i == 0 && !self.leading_wildcard;
            match remainder.find(part.as_str()) {
                Some(pos) if !first_literal || pos == 0 => {
                    remainder = &remainder[pos + part.len()..];
                }
                _ => return false,
            }
        }
        if !self.trailing_wildcard {
            if let Some(last) = self.parts.iter().rev().find(|p| !p.is_empty()) {
                return text.ends_with(last.as_str()) || remainder.is_empty();
            }
        }
        true
    }
}
