//! Generation job pipeline: queue, worker loop, and the exclusive-access
//! wrapper around the diffusion model.
//!
//! The model itself is opaque behind [`resource::DiffusionBackend`]; the
//! engine guarantees that exactly one job runs against it at a time, that
//! jobs execute in admission order, and that every admitted job reaches
//! exactly one terminal event on the bus.

pub mod backend;
pub mod error;
pub mod queue;
pub mod resource;
pub mod service;
pub mod storage;

pub use error::EngineError;
pub use queue::{Job, JobQueue, JobReceiver, DEFAULT_QUEUE_CAPACITY};
pub use resource::{DiffusionBackend, GenerationResource, GenerationSink, RunOutcome, SeedCell};
pub use service::GeneratorService;
pub use storage::ImageStorage;
