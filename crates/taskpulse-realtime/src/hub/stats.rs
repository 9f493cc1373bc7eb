//! Hub runtime statistics: atomic counters plus a rolling send-latency
//! window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

const LATENCY_WINDOW: usize = 1_000;

#[derive(Debug, Default)]
pub struct HubStatistics {
    pub connections_total: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub errors: AtomicU64,
    pub dropped_frames: AtomicU64,
    send_latencies: Mutex<VecDeque<Duration>>,
}

impl HubStatistics {
    pub fn record_send_latency(&self, latency: Duration) {
        let mut latencies = self.send_latencies.lock().unwrap_or_else(|p| p.into_inner());
        if latencies.len() >= LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency);
    }

    pub fn average_send_latency_ms(&self) -> f64 {
        let latencies = self.send_latencies.lock().unwrap_or_else(|p| p.into_inner());
        if latencies.is_empty() {
            return 0.0;
        }
        let total: Duration = latencies.iter().sum();
        total.as_secs_f64() * 1_000.0 / latencies.len() as f64
    }
}

/// Serializable statistics report
#[derive(Debug, Clone, Serialize)]
pub struct HubStatsSnapshot {
    pub connections: ConnectionStats,
    pub messages: MessageStats,
    pub performance: PerformanceStats,
    pub subscriptions: SubscriptionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub active: usize,
    pub max_allowed: usize,
    pub total_created: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub average_latency_ms: f64,
    pub heartbeat_interval: u64,
    pub client_timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub tasks: usize,
    pub channels: usize,
    pub total_task_subscriptions: usize,
    pub total_channel_subscriptions: usize,
}

impl HubStatistics {
    pub fn snapshot(
        &self,
        active: usize,
        max_allowed: usize,
        heartbeat_interval: u64,
        client_timeout: u64,
        subscription_counts: (usize, usize, usize, usize),
    ) -> HubStatsSnapshot {
        let (tasks, channels, total_task, total_channel) = subscription_counts;
        HubStatsSnapshot {
            connections: ConnectionStats {
                active,
                max_allowed,
                total_created: self.connections_total.load(Ordering::Relaxed),
            },
            messages: MessageStats {
                sent: self.messages_sent.load(Ordering::Relaxed),
                received: self.messages_received.load(Ordering::Relaxed),
                errors: self.errors.load(Ordering::Relaxed),
                dropped: self.dropped_frames.load(Ordering::Relaxed),
            },
            performance: PerformanceStats {
                average_latency_ms: (self.average_send_latency_ms() * 100.0).round() / 100.0,
                heartbeat_interval,
                client_timeout,
            },
            subscriptions: SubscriptionStats {
                tasks,
                channels,
                total_task_subscriptions: total_task,
                total_channel_subscriptions: total_channel,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_average() {
        let stats = HubStatistics::default();
        assert_eq!(stats.average_send_latency_ms(), 0.0);

        stats.record_send_latency(Duration::from_millis(2));
        stats.record_send_latency(Duration::from_millis(4));
        assert!((stats.average_send_latency_ms() - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_snapshot_shape() {
        let stats = HubStatistics::default();
        stats.connections_total.fetch_add(7, Ordering::Relaxed);
        stats.messages_sent.fetch_add(42, Ordering::Relaxed);

        let snap = stats.snapshot(3, 1_000, 30, 120, (2, 1, 5, 4));
        assert_eq!(snap.connections.active, 3);
        assert_eq!(snap.connections.total_created, 7);
        assert_eq!(snap.messages.sent, 42);
        assert_eq!(snap.subscriptions.total_task_subscriptions, 5);
        assert_eq!(snap.performance.heartbeat_interval, 30);
    }
}
