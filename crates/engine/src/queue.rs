//! Ordered admission point for generation jobs.
//!
//! A bounded mpsc channel gives strict FIFO dispatch with non-blocking
//! admission; the single receiver is owned by the worker loop, so at
//! most one job is ever in flight. Cancellation is a single-slot signal
//! scoped to the currently running job.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dream_core::request::GenerationRequest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Default bound on queued-but-not-started jobs. The original design was
/// unbounded; a bound turns runaway submission into a visible
/// `QueueFull` instead of unbounded memory growth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Last timestamp handed out for a job id. Kept strictly increasing so
/// two requests admitted in the same microsecond still get distinct ids.
static LAST_ID_STAMP: AtomicI64 = AtomicI64::new(0);

/// A [`GenerationRequest`] admitted to the queue, with its identity.
#[derive(Debug, Clone)]
pub struct Job {
    /// `"{created_at_micros}.{seed}"`, derived only after seed resolution.
    pub id: String,
    /// The request, with its seed guaranteed concrete (never `-1`).
    pub request: GenerationRequest,
}

impl Job {
    /// Resolve the request's seed and derive the job id.
    ///
    /// `fallback_seed` is the resource's current seed, used when the
    /// request submitted `-1`. Id derivation strictly follows seed
    /// resolution so two requests can never collide on an unresolved
    /// sentinel; the timestamp component is a monotonic microsecond
    /// stamp so same-seed requests never collide either.
    pub fn assign(mut request: GenerationRequest, fallback_seed: i64) -> Self {
        if request.seed_is_unset() {
            request.seed = fallback_seed;
        }
        let stamp = next_id_stamp(request.created_at.timestamp_micros());
        let id = format!("{stamp}.{}", request.seed);
        Self { id, request }
    }
}

/// The request's timestamp, bumped past the last one handed out when
/// admissions land within the same microsecond.
fn next_id_stamp(now_micros: i64) -> i64 {
    let mut last = LAST_ID_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now_micros.max(last + 1);
        match LAST_ID_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

// ---------------------------------------------------------------------------
// Current-job slot
// ---------------------------------------------------------------------------

/// Shared slot describing the job the worker is currently running.
///
/// Plain `std::sync::Mutex`: all critical sections are a few loads, and
/// no await point ever holds the guard.
#[derive(Default)]
struct CurrentSlot {
    inner: Mutex<Option<(String, CancellationToken)>>,
}

// ---------------------------------------------------------------------------
// JobQueue (submitter half)
// ---------------------------------------------------------------------------

/// Cloneable submission handle. Pair with the single [`JobReceiver`]
/// returned by [`JobQueue::new`].
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    current: Arc<CurrentSlot>,
    capacity: usize,
}

impl JobQueue {
    /// Create a queue with the given capacity, returning the submitter
    /// handle and the worker-side receiver.
    pub fn new(capacity: usize) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let current = Arc::new(CurrentSlot::default());
        let queue = Self {
            tx,
            current: Arc::clone(&current),
            capacity,
        };
        let receiver = JobReceiver { rx, current };
        (queue, receiver)
    }

    /// Admit a job. Never blocks the caller.
    pub fn enqueue(&self, job: Job) -> Result<(), EngineError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(request_id = %job.id, capacity = self.capacity, "Queue full, rejecting job");
                Err(EngineError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::QueueClosed),
        }
    }

    /// Request cooperative cancellation of the currently running job.
    ///
    /// Queued-but-not-started jobs are unaffected. With no job running
    /// this is a no-op, not an error.
    pub fn cancel_current(&self) {
        let slot = self.current.inner.lock().expect("current-job slot poisoned");
        match slot.as_ref() {
            Some((id, token)) => {
                tracing::info!(request_id = %id, "Cancellation requested");
                token.cancel();
            }
            None => {
                tracing::debug!("Cancel received with no job running");
            }
        }
    }

    /// Id of the job currently being generated, if any.
    pub fn current_job_id(&self) -> Option<String> {
        self.current
            .inner
            .lock()
            .expect("current-job slot poisoned")
            .as_ref()
            .map(|(id, _)| id.clone())
    }

    /// Number of admitted jobs not yet picked up by the worker.
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

// ---------------------------------------------------------------------------
// JobReceiver (worker half)
// ---------------------------------------------------------------------------

/// The worker's end of the queue. Exactly one exists per queue, which is
/// what makes one-at-a-time execution structural.
pub struct JobReceiver {
    rx: mpsc::Receiver<Job>,
    current: Arc<CurrentSlot>,
}

impl JobReceiver {
    /// Wait for the next job. `None` once all submitter handles are
    /// dropped and the queue is drained.
    pub async fn next(&mut self) -> Option<Job> {
        self.rx.recv().await
    }

    /// Stop admissions: subsequent `enqueue` calls fail with
    /// [`EngineError::QueueClosed`]. Jobs already admitted remain
    /// receivable via [`next`](Self::next) until the queue is drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Mark `id` as the in-flight job and get its fresh cancel token.
    pub fn begin(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut slot = self.current.inner.lock().expect("current-job slot poisoned");
        *slot = Some((id.to_string(), token.clone()));
        token
    }

    /// Clear the in-flight slot after the job's terminal event.
    pub fn finish(&self) {
        let mut slot = self.current.inner.lock().expect("current-job slot poisoned");
        *slot = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
