//! WebSocket transport: one reader loop, one writer task per connection.
//!
//! The writer drains the connection's mailbox, preserving the hub's
//! per-connection frame order; the reader feeds incoming frames to the hub.
//! Close codes: 1000 normal, 1002 protocol violation (duplicate client id),
//! 1013 capacity.

use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use taskpulse_shared::error::PulseError;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub client_id: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| client_session(state, socket, query))
}

async fn client_session(state: AppState, mut socket: WebSocket, query: WsQuery) {
    let handle = match state
        .hub
        .connect(query.client_id, query.token.as_deref())
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            let (code, reason) = close_frame_for(&e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };
    let client_id = handle.client_id.clone();

    let (mut sender, mut receiver) = socket.split();

    let writer_hub = state.hub.clone();
    let mailbox = handle.mailbox.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = mailbox.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "outgoing frame not serializable");
                    continue;
                }
            };
            let started = Instant::now();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            writer_hub.record_send_latency(started.elapsed());
        }
        let _ = sender.close().await;
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => state.hub.handle_frame(&client_id, text.as_str()).await,
            Ok(Message::Close(_)) => {
                debug!(client_id, "client closed connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {}
            Err(e) => {
                debug!(client_id, error = %e, "websocket receive error");
                break;
            }
        }
    }

    state.hub.disconnect(&client_id, "connection closed");
    writer.abort();
}

fn close_frame_for(error: &PulseError) -> (u16, &'static str) {
    match error {
        PulseError::Capacity(_) => (1013, "Maximum connections reached"),
        PulseError::Conflict(_) => (1002, "Client ID already exists"),
        PulseError::ShuttingDown => (1013, "server_shutdown"),
        _ => (1011, "server error"),
    }
}
