//! Two-party relay socket

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use metaverse_sfu::RelayEvent;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::http::{websocket::WsQuery, AppResult, AppState, MAX_MESSAGE_SIZE};

pub async fn relay_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    state.authorize(query.token.as_deref())?;

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();
    let mut connection = state.relay.connect(tx);
    let connection_id = connection.id().to_string();
    info!(connection_id = %connection_id, "Relay connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(connection_id = %writer_id, error = %e, "Failed to encode relay event");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Relay receive error");
                break;
            }
        }
    }

    connection.leave();
    writer.abort();
    info!(connection_id = %connection_id, "Relay connection closed");
}
