//! Relays generation events from the bus to every WebSocket client.

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::broadcast;

use dream_events::GenerationEvent;

use crate::ws::WsManager;

/// Spawn a task that forwards every bus event to all connected clients
/// as a JSON text frame.
///
/// Slow consumption shows up as `Lagged` on the broadcast receiver; the
/// skipped events are simply dropped, since progress frames are advisory
/// and terminal events are also visible via `/health`. The task exits
/// when the bus sender is dropped.
pub fn start_event_relay(
    ws_manager: Arc<WsManager>,
    mut events: broadcast::Receiver<GenerationEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(text) => ws_manager.broadcast(Message::Text(text.into())).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize event");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event relay lagged, dropping events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, stopping relay");
                    break;
                }
            }
        }
    })
}
