/// Errors produced by the generation engine.
///
/// `ResourceLoad` is fatal (the process cannot serve jobs); `Execution`
/// is scoped to a single job and leaves the resource usable; the queue
/// variants are reported synchronously to the submitter.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model load failed: {0}")]
    ResourceLoad(String),

    #[error("Generation failed: {0}")]
    Execution(String),

    #[error("Image storage failed: {0}")]
    Storage(String),

    #[error("Job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Job queue is shut down")]
    QueueClosed,
}
