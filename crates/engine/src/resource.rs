//! Exclusive-access wrapper around the diffusion model.
//!
//! The model is opaque behind the [`DiffusionBackend`] trait: slow to
//! load, stateful, and able to run only one generation at a time. The
//! engine never shares a backend handle — a single [`GenerationResource`]
//! is owned by the worker loop, which is what enforces the no-overlap
//! invariant structurally rather than with a lock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dream_core::request::GenerationRequest;
use image::DynamicImage;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Run callbacks
// ---------------------------------------------------------------------------

/// Per-invocation capability object receiving step and image callbacks.
///
/// Injected into each [`GenerationResource::run`] call; requests stay
/// pure values and never carry callbacks themselves. Implementations
/// must be fast: they execute synchronously on the worker between
/// diffusion steps.
pub trait GenerationSink {
    /// Called after every completed diffusion step. `step` is zero-based
    /// within the current image. `preview` is present only when the
    /// request asked for intermediate images.
    fn on_step(&mut self, step: u32, preview: Option<&DynamicImage>);

    /// Called once per produced image. The first delivery for a given
    /// seed has `upscaled == false` and is the primary result; a later
    /// delivery for the same seed with `upscaled == true` is a
    /// post-processing enhancement, not a new result.
    fn on_image(&mut self, image: &DynamicImage, seed: i64, upscaled: bool);
}

/// How a (non-failed) run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All requested images were produced.
    Complete,
    /// The cancellation token fired at a step boundary; remaining work
    /// was abandoned and partial images discarded.
    Cancelled,
}

// ---------------------------------------------------------------------------
// DiffusionBackend
// ---------------------------------------------------------------------------

/// The opaque, slow, stateful model that turns prompts into pixels.
///
/// `generate` is blocking and accelerator-bound; callers run it on a
/// dedicated blocking thread. Implementations must check `cancel` at
/// every step boundary (not only between images) and return
/// [`RunOutcome::Cancelled`] promptly.
pub trait DiffusionBackend: Send {
    /// Load model weights. Called once via
    /// [`GenerationResource::ensure_loaded`]; failure is fatal.
    fn load(&mut self) -> Result<(), EngineError>;

    /// The backend's current default seed: the seed of the last
    /// completed run, used to resolve requests that submitted `-1`.
    fn seed(&self) -> i64;

    /// Whether a face-restoration model is present in this deployment.
    fn face_restoration_available(&self) -> bool {
        false
    }

    /// Run one job. The request's seed is already concrete (never `-1`).
    ///
    /// A domain failure (e.g. out-of-memory for the requested size) is
    /// an `Err` scoped to this job only; the backend must remain usable
    /// for subsequent calls.
    fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn GenerationSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError>;
}

// ---------------------------------------------------------------------------
// SeedCell
// ---------------------------------------------------------------------------

/// Shared, read-mostly view of the resource's current default seed.
///
/// The worker publishes the backend seed here after each completed run;
/// submitters read it to resolve `-1` seeds without touching the backend
/// itself. Readers always observe the value as of the last completed
/// run, never a mid-run transient.
#[derive(Clone)]
pub struct SeedCell(Arc<AtomicI64>);

impl SeedCell {
    fn new(initial: i64) -> Self {
        Self(Arc::new(AtomicI64::new(initial)))
    }

    /// The seed as of the last completed run.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, seed: i64) {
        self.0.store(seed, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// GenerationResource
// ---------------------------------------------------------------------------

/// Owns the one backend handle and its load-once lifecycle.
pub struct GenerationResource {
    backend: Box<dyn DiffusionBackend>,
    loaded: bool,
    seed_cell: SeedCell,
}

impl GenerationResource {
    pub fn new(backend: Box<dyn DiffusionBackend>) -> Self {
        let seed_cell = SeedCell::new(backend.seed());
        Self {
            backend,
            loaded: false,
            seed_cell,
        }
    }

    /// Load the model exactly once. Safe to call redundantly; subsequent
    /// calls are no-ops.
    pub fn ensure_loaded(&mut self) -> Result<(), EngineError> {
        if self.loaded {
            return Ok(());
        }
        self.backend.load()?;
        self.loaded = true;
        self.seed_cell.set(self.backend.seed());
        Ok(())
    }

    /// The backend's current default seed.
    pub fn current_seed(&self) -> i64 {
        self.backend.seed()
    }

    /// A cloneable handle other threads can use to read the current
    /// seed without access to the backend.
    pub fn seed_cell(&self) -> SeedCell {
        self.seed_cell.clone()
    }

    pub fn face_restoration_available(&self) -> bool {
        self.backend.face_restoration_available()
    }

    /// Run one job to completion, cancellation, or failure.
    ///
    /// Blocking; the worker calls this from a blocking task. On success
    /// or cancellation the seed cell is refreshed from the backend so
    /// later `-1` submissions resolve against the latest seed.
    pub fn run(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn GenerationSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        self.ensure_loaded()?;
        let outcome = self.backend.generate(request, sink, cancel)?;
        self.seed_cell.set(self.backend.seed());
        Ok(outcome)
    }
}
