use std::sync::Arc;

use dream_engine::{JobQueue, SeedCell};

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all handlers.
///
/// Cheap to clone: every field is either `Copy` or reference-counted.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Submission handle for the generation queue.
    pub queue: JobQueue,
    /// Last completed seed, used to resolve the `-1` seed sentinel.
    pub seed_cell: SeedCell,
    /// Active WebSocket connections.
    pub ws_manager: Arc<WsManager>,
    /// Whether the loaded model supports face restoration.
    pub face_restore_available: bool,
}
