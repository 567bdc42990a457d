//! Signaling WebSocket
//!
//! One socket per peer. Text frames carry JSON envelopes; the peer's
//! [`PeerSession`](roomcast_sfu::PeerSession) handles them one at a time in
//! arrival order while a writer task drains the outbound queue. Closing the
//! socket, cleanly or not, releases everything the peer owned.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use roomcast_sfu::ServerMessage;
use tracing::{debug, error, info, warn};

use crate::http::AppState;

/// WebSocket handler for the signaling channel
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (session, mut outbound) = match state.sfu.join() {
        Ok(joined) => joined,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket connection");
            if let Ok(text) = ServerMessage::error(&e).to_json() {
                let _ = ws_sink.send(Message::Text(text.into())).await;
            }
            let _ = ws_sink.close().await;
            return;
        }
    };
    let peer_id = session.peer_id().clone();

    info!(peer_id = %peer_id, "WebSocket connection established");

    // Server messages -> WebSocket. Ends once the peer is released and the
    // registry drops its sender.
    let writer_peer_id = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(peer_id = %writer_peer_id, action = message.action(), "Failed to encode message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer_id, "Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Binary(_)) => {
                debug!(peer_id = %peer_id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by axum
            Ok(_) => {}
            Err(e) => {
                debug!(peer_id = %peer_id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    session.leave();
    if let Err(e) = writer.await {
        warn!(peer_id = %peer_id, "WebSocket writer task failed: {}", e);
    }

    info!(peer_id = %peer_id, "WebSocket connection closed");
}
