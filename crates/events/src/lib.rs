//! Progress/result event channel for generation jobs.
//!
//! Transport-independent: the engine publishes [`GenerationEvent`]s to an
//! [`EventBus`] and whatever adapter is interested (WebSocket relay,
//! tests) subscribes.

pub mod bus;

pub use bus::{EventBus, GenerationEvent};
