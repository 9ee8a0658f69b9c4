//! WebSocket infrastructure for real-time generation events.
//!
//! Provides connection management, heartbeat monitoring, and the HTTP
//! upgrade handler used by Axum routes. Clients receive the event stream
//! (progress, result, cancelled, error) and may submit `generate` and
//! `cancel` messages over the same socket.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
