//! SFU signaling socket
//!
//! JSON text frames in both directions. Inbound requests are handled one
//! at a time by a [`SignalingSession`]; acknowledgments and room events
//! share one outbound queue drained by a writer task, which also pings the
//! client every heartbeat interval. A client silent for longer than the
//! peer timeout is treated as departed.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use metaverse_sfu::{EventSink, PeerId, ServerMessage, SignalingSession};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::http::{AppResult, AppState, MAX_MESSAGE_SIZE};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: Option<String>,
}

/// Clients should provide the JWT via query parameter when auth is enabled:
/// <ws://host/ws?token={jwt_token}>
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let claims = state.authorize(query.token.as_deref())?;
    let user_id = claims.map(|c| c.user_id);

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<String>) {
    let config = state.manager.config();
    let (heartbeat, peer_timeout) = (config.heartbeat_interval(), config.peer_timeout());

    let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut session = SignalingSession::new(state.manager.clone(), EventSink::new(tx.clone()));
    if let Some(user_id) = &user_id {
        session = session.with_identity(PeerId::from(user_id.as_str()));
    }
    let connection_id = session.connection_id().clone();

    info!(
        connection_id = %connection_id,
        user_id = user_id.as_deref().unwrap_or("anonymous"),
        "Signaling connection established"
    );

    let (ws_sink, mut ws_stream) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sink, rx, heartbeat, connection_id.clone()));

    loop {
        let message = match tokio::time::timeout(peer_timeout, ws_stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(
                    connection_id = %connection_id,
                    timeout_secs = peer_timeout.as_secs(),
                    "Signaling connection timed out"
                );
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if let Some(reply) = session.handle_text(text.as_str()).await {
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(connection_id = %connection_id, "Ignoring binary signaling frame");
            }
            // Pongs only reset the timeout
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    session.close().await;
    writer.abort();

    info!(connection_id = %connection_id, "Signaling connection closed");
}

async fn write_loop(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    heartbeat: Duration,
    connection_id: PeerId,
) {
    let mut ping = tokio::time::interval(heartbeat);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection_id = %connection_id, error = %e, "Failed to encode signaling message");
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                    debug!(connection_id = %connection_id, error = %e, "Failed to send WebSocket message");
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = ws_sink.close().await;
}
