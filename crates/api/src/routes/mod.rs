pub mod generate;
pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /ws         WebSocket (events out, generate/cancel in)
/// /generate   submit a generation request (POST)
/// /cancel     cancel the currently running job (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/generate", post(generate::submit))
        .route("/cancel", post(generate::cancel))
}
