//! Store-pub/sub event pump.
//!
//! The hub consumes the gateway's `progress_updates` subscription rather
//! than an in-process channel, so a multi-process deployment (engine and
//! hub in different processes) behaves identically. When the subscription
//! drops the pump resubscribes with backoff; connected clients keep their
//! heartbeats and welcome state and event flow resumes without reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskpulse_shared::store::{StoreGateway, PROGRESS_CHANNEL};
use taskpulse_shared::types::ProgressEvent;

use super::fanout::FanoutHub;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Run until cancelled: subscribe, route events into the hub, resubscribe
/// on stream loss.
pub async fn run_event_pump(hub: Arc<FanoutHub>, gateway: StoreGateway, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            return;
        }

        let mut stream = match gateway.subscribe(PROGRESS_CHANNEL).await {
            Ok(stream) => {
                info!(channel = PROGRESS_CHANNEL, "event pump subscribed");
                stream
            }
            Err(e) => {
                warn!(error = %e, "event pump subscription failed, retrying");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => continue,
                }
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                message = stream.recv() => {
                    match message {
                        Some(payload) => {
                            match serde_json::from_str::<ProgressEvent>(&payload) {
                                Ok(event) => hub.broadcast_event(&event).await,
                                Err(e) => debug!(error = %e, "dropping undecodable progress event"),
                            }
                        }
                        None => {
                            warn!("event pump stream closed, resubscribing");
                            break;
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }
    }
}
