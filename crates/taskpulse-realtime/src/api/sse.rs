//! One-way event stream over a long-lived HTTP response.
//!
//! Emits the same frame JSON as the WebSocket transport, prefixed by an
//! event name line. Clients pick channels via the `channels` query
//! parameter; the connection is torn down when the response stream drops.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;

use taskpulse_shared::error::PulseError;
use taskpulse_shared::types::Channel;

use crate::hub::FanoutHub;

use super::http::ApiError;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    pub token: Option<String>,
    /// Comma-separated subset of the enumerated channels
    pub channels: Option<String>,
}

/// Disconnects the hub connection when the response stream is dropped
struct StreamGuard {
    hub: Arc<FanoutHub>,
    client_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.hub.disconnect(&self.client_id, "stream closed");
    }
}

pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut channels = Vec::new();
    if let Some(raw) = &query.channels {
        for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let channel: Channel = name
                .parse()
                .map_err(|_| PulseError::Validation(format!("unknown channel: {name}")))?;
            channels.push(channel);
        }
    }

    let handle = state.hub.connect_one_way(None, query.token.as_deref()).await?;
    state
        .hub
        .registry()
        .subscribe_channels(&handle.client_id, &channels);

    let guard = StreamGuard {
        hub: state.hub.clone(),
        client_id: handle.client_id.clone(),
    };
    let mailbox = handle.mailbox;

    let stream = futures::stream::unfold((mailbox, guard), |(mailbox, guard)| async move {
        let frame = mailbox.recv().await?;
        let event = Event::default()
            .event(frame.payload.frame_type())
            .data(frame.to_json().unwrap_or_else(|_| "{}".to_string()));
        Some((Ok::<_, Infallible>(event), (mailbox, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
