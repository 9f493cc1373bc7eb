//! Connection registry and its two inverted indices.
//!
//! All mutations happen under one lock so a connection is in every index it
//! is subscribed to and nowhere else, and removal is atomic across indices.
//! Subscription changes are visible to the next broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use taskpulse_shared::error::PulseError;
use taskpulse_shared::types::Channel;

use super::connection::{ClientConnection, Mailbox};

#[derive(Debug, Default)]
struct Inner {
    clients: HashMap<String, ClientConnection>,
    by_task: HashMap<String, HashSet<String>>,
    by_channel: HashMap<Channel, HashSet<String>>,
}

/// Registry of live connections, capped at `max_connections`
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.lock().clients.contains_key(client_id)
    }

    /// Insert a new connection, enforcing the capacity cap and client-id
    /// uniqueness.
    pub fn insert(&self, connection: ClientConnection) -> Result<(), PulseError> {
        let mut inner = self.lock();
        if inner.clients.len() >= self.max_connections {
            return Err(PulseError::Capacity(format!(
                "maximum connections reached ({})",
                self.max_connections
            )));
        }
        if inner.clients.contains_key(&connection.client_id) {
            return Err(PulseError::Conflict(format!(
                "client {} already connected",
                connection.client_id
            )));
        }
        inner.clients.insert(connection.client_id.clone(), connection);
        Ok(())
    }

    /// Remove a connection and purge it from both indices atomically.
    /// Idempotent: removing an unknown id returns `None`.
    pub fn remove(&self, client_id: &str) -> Option<ClientConnection> {
        let mut inner = self.lock();
        let connection = inner.clients.remove(client_id)?;
        for task_id in &connection.subscribed_tasks {
            if let Some(subscribers) = inner.by_task.get_mut(task_id) {
                subscribers.remove(client_id);
                if subscribers.is_empty() {
                    inner.by_task.remove(task_id);
                }
            }
        }
        for channel in &connection.subscribed_channels {
            if let Some(subscribers) = inner.by_channel.get_mut(channel) {
                subscribers.remove(client_id);
                if subscribers.is_empty() {
                    inner.by_channel.remove(channel);
                }
            }
        }
        Some(connection)
    }

    pub fn subscribe_tasks(&self, client_id: &str, task_ids: &[String]) {
        let mut inner = self.lock();
        if !inner.clients.contains_key(client_id) {
            return;
        }
        for task_id in task_ids {
            if let Some(connection) = inner.clients.get_mut(client_id) {
                connection.subscribed_tasks.insert(task_id.clone());
            }
            inner
                .by_task
                .entry(task_id.clone())
                .or_default()
                .insert(client_id.to_string());
        }
    }

    pub fn unsubscribe_tasks(&self, client_id: &str, task_ids: &[String]) {
        let mut inner = self.lock();
        for task_id in task_ids {
            if let Some(connection) = inner.clients.get_mut(client_id) {
                connection.subscribed_tasks.remove(task_id);
            }
            if let Some(subscribers) = inner.by_task.get_mut(task_id) {
                subscribers.remove(client_id);
                if subscribers.is_empty() {
                    inner.by_task.remove(task_id);
                }
            }
        }
    }

    pub fn subscribe_channels(&self, client_id: &str, channels: &[Channel]) {
        let mut inner = self.lock();
        if !inner.clients.contains_key(client_id) {
            return;
        }
        for channel in channels {
            if let Some(connection) = inner.clients.get_mut(client_id) {
                connection.subscribed_channels.insert(*channel);
            }
            inner
                .by_channel
                .entry(*channel)
                .or_default()
                .insert(client_id.to_string());
        }
    }

    pub fn unsubscribe_channels(&self, client_id: &str, channels: &[Channel]) {
        let mut inner = self.lock();
        for channel in channels {
            if let Some(connection) = inner.clients.get_mut(client_id) {
                connection.subscribed_channels.remove(channel);
            }
            if let Some(subscribers) = inner.by_channel.get_mut(channel) {
                subscribers.remove(client_id);
                if subscribers.is_empty() {
                    inner.by_channel.remove(channel);
                }
            }
        }
    }

    /// Mailboxes of the connections subscribed to a task
    pub fn task_subscribers(&self, task_id: &str) -> Vec<(String, Arc<Mailbox>)> {
        let inner = self.lock();
        inner
            .by_task
            .get(task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        inner
                            .clients
                            .get(id)
                            .map(|c| (id.clone(), c.mailbox.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mailboxes of the connections subscribed to a channel
    pub fn channel_subscribers(&self, channel: Channel) -> Vec<(String, Arc<Mailbox>)> {
        let inner = self.lock();
        inner
            .by_channel
            .get(&channel)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        inner
                            .clients
                            .get(id)
                            .map(|c| (id.clone(), c.mailbox.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mailbox_of(&self, client_id: &str) -> Option<Arc<Mailbox>> {
        self.lock().clients.get(client_id).map(|c| c.mailbox.clone())
    }

    pub fn subscriptions_of(&self, client_id: &str) -> (Vec<String>, Vec<Channel>) {
        let inner = self.lock();
        inner
            .clients
            .get(client_id)
            .map(|c| {
                let mut tasks: Vec<String> = c.subscribed_tasks.iter().cloned().collect();
                tasks.sort();
                let channels: Vec<Channel> = c.subscribed_channels.iter().copied().collect();
                (tasks, channels)
            })
            .unwrap_or_default()
    }

    pub fn touch_heartbeat(&self, client_id: &str) {
        if let Some(connection) = self.lock().clients.get_mut(client_id) {
            connection.last_heartbeat = std::time::Instant::now();
        }
    }

    pub fn record_received(&self, client_id: &str) {
        if let Some(connection) = self.lock().clients.get_mut(client_id) {
            connection.messages_received += 1;
        }
    }

    pub fn record_sent(&self, client_id: &str) {
        if let Some(connection) = self.lock().clients.get_mut(client_id) {
            connection.messages_sent += 1;
        }
    }

    /// Connections whose heartbeat age strictly exceeds the timeout.
    /// A heartbeat exactly at the timeout is still alive; one-way
    /// connections are reaped by their transport, not by heartbeat.
    pub fn stale_connections(&self, timeout: Duration) -> Vec<String> {
        let inner = self.lock();
        inner
            .clients
            .values()
            .filter(|c| !c.one_way && c.last_heartbeat.elapsed() > timeout)
            .map(|c| c.client_id.clone())
            .collect()
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.lock().clients.keys().cloned().collect()
    }

    /// (distinct subscribed tasks, distinct subscribed channels,
    /// total task subscriptions, total channel subscriptions)
    pub fn subscription_counts(&self) -> (usize, usize, usize, usize) {
        let inner = self.lock();
        (
            inner.by_task.len(),
            inner.by_channel.len(),
            inner.by_task.values().map(HashSet::len).sum(),
            inner.by_channel.values().map(HashSet::len).sum(),
        )
    }

    /// Index consistency check used by tests: every connection appears in
    /// exactly the index entries it is subscribed to, and vice versa.
    pub fn indices_consistent(&self) -> bool {
        let inner = self.lock();
        for (id, connection) in &inner.clients {
            for task in &connection.subscribed_tasks {
                if !inner.by_task.get(task).is_some_and(|s| s.contains(id)) {
                    return false;
                }
            }
            for channel in &connection.subscribed_channels {
                if !inner.by_channel.get(channel).is_some_and(|s| s.contains(id)) {
                    return false;
                }
            }
        }
        for (task, ids) in &inner.by_task {
            for id in ids {
                let Some(connection) = inner.clients.get(id) else {
                    return false;
                };
                if !connection.subscribed_tasks.contains(task) {
                    return false;
                }
            }
        }
        for (channel, ids) in &inner.by_channel {
            for id in ids {
                let Some(connection) = inner.clients.get(id) else {
                    return false;
                };
                if !connection.subscribed_channels.contains(channel) {
                    return false;
                }
            }
        }
        true
    }
}
