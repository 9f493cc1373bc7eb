//! # Cleanup Sweep
//!
//! Background sweep deleting terminal tasks whose completion is older than
//! the retention TTL: the task record, its timeline, and its membership in
//! the active and completed indices go in one transactional pipeline per
//! task. The sweep is idempotent and safe to re-enter.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskpulse_shared::config::ProgressConfig;
use taskpulse_shared::error::PulseResult;
use taskpulse_shared::store::{
    events_key, task_id_from_key, task_key, Pipeline, StoreCommand, StoreGateway, ACTIVE_TASKS_KEY,
    COMPLETED_TASKS_KEY, TASK_KEY_PREFIX,
};
use taskpulse_shared::types::TaskRecord;

/// Periodic remover of expired terminal tasks
#[derive(Debug)]
pub struct CleanupSweeper {
    gateway: StoreGateway,
    config: ProgressConfig,
}

impl CleanupSweeper {
    pub fn new(gateway: StoreGateway, config: ProgressConfig) -> Self {
        Self { gateway, config }
    }

    /// Run until cancelled, sweeping every `cleanup_interval_hours`.
    pub async fn run(self, token: CancellationToken) {
        let interval = Duration::from_secs(self.config.cleanup_interval_hours * 3_600);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.sweep().await {
                        Ok(removed) if removed > 0 => info!(removed, "cleanup sweep removed expired tasks"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "cleanup sweep failed, will retry next interval"),
                    }
                }
            }
        }
    }

    /// One pass over the task keyspace. Returns the number of tasks removed.
    pub async fn sweep(&self) -> PulseResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.completed_task_ttl_days);
        let keys = self.gateway.scan(&format!("{TASK_KEY_PREFIX}*")).await?;
        let mut removed = 0u64;

        for key in keys {
            let Some(task_id) = task_id_from_key(&key).map(str::to_string) else {
                continue;
            };
            let Some(data) = self.gateway.hash_get(&key, "data").await? else {
                continue;
            };
            let record: TaskRecord = match serde_json::from_str(&data) {
                Ok(record) => record,
                Err(e) => {
                    warn!(task_id, error = %e, "skipping undecodable task record during sweep");
                    continue;
                }
            };

            let expired = record.status.is_terminal()
                && record.completed_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }

            let pipeline = Pipeline::transactional()
                .push(StoreCommand::Delete {
                    key: task_key(&task_id),
                })
                .push(StoreCommand::Delete {
                    key: events_key(&task_id),
                })
                .push(StoreCommand::SetRemove {
                    key: ACTIVE_TASKS_KEY.into(),
                    member: task_id.clone(),
                })
                .push(StoreCommand::SortedRemove {
                    key: COMPLETED_TASKS_KEY.into(),
                    member: task_id.clone(),
                });
            self.gateway.pipeline(pipeline).await?;
            removed += 1;

            // Long keyspaces: stay cooperative between deletions
            tokio::task::yield_now().await;
        }
        Ok(removed)
    }
}
