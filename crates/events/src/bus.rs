//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`GenerationEvent`]s.
//! It is designed to be shared via `Arc<EventBus>` across the application.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// GenerationEvent
// ---------------------------------------------------------------------------

/// A per-job event emitted by the generator worker.
///
/// For a given `request_id` the published sequence is: zero or more
/// `Progress` events with non-decreasing fraction, interleaved with a
/// `Result` per produced image, ending in exactly one terminal event
/// (the final `Result`, a `Cancelled`, or an `Error`). Serializes with a
/// lowercase `"type"` tag so adapters can forward frames verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GenerationEvent {
    /// The in-flight job finished one diffusion step.
    Progress {
        #[serde(rename = "requestId")]
        request_id: String,
        /// Completed fraction of the current image, in `(0, 1]`.
        fraction: f64,
    },

    /// A primary image was produced and persisted.
    Result {
        #[serde(rename = "requestId")]
        request_id: String,
        /// Storage reference of the saved image, not raw pixels.
        url: String,
        /// The concrete seed that produced this image.
        seed: i64,
    },

    /// The job was cancelled before completing.
    Cancelled {
        #[serde(rename = "requestId")]
        request_id: String,
    },

    /// The job failed. The resource itself remains usable.
    Error {
        #[serde(rename = "requestId")]
        request_id: String,
        message: String,
    },
}

impl GenerationEvent {
    /// The id of the job this event belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            GenerationEvent::Progress { request_id, .. }
            | GenerationEvent::Result { request_id, .. }
            | GenerationEvent::Cancelled { request_id }
            | GenerationEvent::Error { request_id, .. } => request_id,
        }
    }

    /// Whether this event can end a job's event stream.
    ///
    /// `Result` is terminal only when it is the job's last image; the
    /// worker guarantees no further events follow it in that case.
    pub fn is_terminal_kind(&self) -> bool {
        !matches!(self, GenerationEvent::Progress { .. })
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`GenerationEvent`]. There is
/// no durable log: a subscriber that connects mid-job observes at most
/// the job's remaining events.
pub struct EventBus {
    sender: broadcast::Sender<GenerationEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed messages are
    /// dropped and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// delivery is best-effort by design.
    pub fn publish(&self, event: GenerationEvent) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
