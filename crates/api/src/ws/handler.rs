use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::routes::generate::submit_generation;
use crate::state::AppState;
use crate::ws::manager::WsManager;

/// Inbound client message, discriminated by a `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    /// Submit a generation request; the remaining fields are the request body.
    Generate {
        #[serde(flatten)]
        body: serde_json::Value,
    },
    /// Cancel the currently running job.
    Cancel,
}

/// HTTP handler that upgrades the connection to WebSocket.
///
/// After the upgrade the connection is registered with `WsManager` and
/// managed by two spawned tasks (sender + receiver).
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with `WsManager`.
///   2. Spawns a sender task that forwards messages from the manager channel.
///   3. Processes inbound messages on the current task.
///   4. Cleans up on disconnect.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    // Register and get the receiver for outbound messages.
    let ws_manager = Arc::clone(&state.ws_manager);
    let mut rx = ws_manager.add(conn_id.clone()).await;

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward channel messages to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    // Receiver loop: process inbound messages.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(Message::Text(text)) => {
                handle_message(&state, &ws_manager, &conn_id, text.as_str()).await;
            }
            Ok(_msg) => {
                // Binary and Ping frames are ignored.
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Clean up: remove connection and abort sender task.
    ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Dispatch one inbound text frame.
///
/// Submission outcomes are acknowledged back to the sending connection
/// only; job events themselves arrive via the broadcast relay.
async fn handle_message(state: &AppState, ws_manager: &WsManager, conn_id: &str, text: &str) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            let reply = json!({ "type": "rejected", "error": format!("Malformed message: {e}") });
            send_json(ws_manager, conn_id, &reply).await;
            return;
        }
    };

    match parsed {
        ClientMessage::Generate { body } => {
            let reply = match submit_generation(state, &body) {
                Ok(request_id) => json!({ "type": "accepted", "requestId": request_id }),
                Err(e) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "Generation request rejected");
                    json!({ "type": "rejected", "error": e.to_string() })
                }
            };
            send_json(ws_manager, conn_id, &reply).await;
        }
        ClientMessage::Cancel => {
            let request_id = state.queue.current_job_id();
            state.queue.cancel_current();
            let reply = json!({ "type": "accepted", "requestId": request_id });
            send_json(ws_manager, conn_id, &reply).await;
        }
    }
}

async fn send_json(ws_manager: &WsManager, conn_id: &str, value: &serde_json::Value) {
    let text = value.to_string();
    ws_manager.send_to(conn_id, Message::Text(text.into())).await;
}
