//! # Background Task Supervisor
//!
//! Long-running loops (heartbeat, cleanup, collection, alert evaluation,
//! optimizer cycles) are owned by a [`Supervisor`] rather than spawned
//! loose. All children share one cancellation token; shutdown cancels the
//! token and drains the set within a bounded deadline.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the lifecycle of supervised background tasks
#[derive(Debug)]
pub struct Supervisor {
    token: CancellationToken,
    tasks: tokio::sync::Mutex<JoinSet<&'static str>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Cancellation token shared by every supervised loop. Loops must check
    /// it between iterations.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a named background loop. The future is expected to return when
    /// the supervisor's token is cancelled.
    pub async fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            debug!(task = name, "background task started");
            future.await;
            debug!(task = name, "background task exited");
            name
        });
        info!(task = name, "background task spawned");
    }

    /// Convenience: spawn a loop that runs `tick` every `interval` until
    /// cancellation. A failed iteration is logged and the loop continues.
    pub async fn spawn_interval<F, Fut>(&self, name: &'static str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let token = self.token.clone();
        self.spawn(name, async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => tick().await,
                }
            }
        })
        .await;
    }

    /// Cancel all children and wait for them to drain, up to `deadline`.
    /// Returns the number of tasks that did not exit in time.
    pub async fn shutdown(&self, deadline: Duration) -> usize {
        self.token.cancel();

        let mut tasks = self.tasks.lock().await;
        let drain = async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(name) => debug!(task = name, "background task drained"),
                    Err(e) => warn!(error = %e, "background task panicked during shutdown"),
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            let remaining = tasks.len();
            warn!(
                remaining,
                deadline_ms = deadline.as_millis() as u64,
                "shutdown deadline exceeded, aborting remaining tasks"
            );
            tasks.abort_all();
            remaining
        } else {
            0
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let supervisor = Supervisor::new();
        let token = supervisor.token();
        supervisor
            .spawn("waiter", async move {
                token.cancelled().await;
            })
            .await;

        let stragglers = supervisor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(stragglers, 0);
    }

    #[tokio::test]
    async fn test_interval_loop_ticks_until_cancelled() {
        let supervisor = Supervisor::new();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        supervisor
            .spawn_interval("ticker", Duration::from_millis(10), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let seen = count.load(Ordering::Relaxed);
        assert!(seen >= 3, "expected at least 3 ticks, saw {seen}");

        supervisor.shutdown(Duration::from_secs(1)).await;
        let after = count.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::Relaxed), after, "loop kept ticking after shutdown");
    }
}
