//! Deterministic stand-in backend.
//!
//! [`SyntheticBackend`] produces seeded procedural images while walking
//! the exact step/image/cancellation protocol a real diffusion backend
//! must follow. It serves deployments without model weights (demos,
//! CI) and is what the engine tests drive.

use std::thread;
use std::time::Duration;

use dream_core::request::GenerationRequest;
use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::resource::{DiffusionBackend, GenerationSink, RunOutcome};

/// Procedural image generator implementing the backend protocol.
pub struct SyntheticBackend {
    seed: i64,
    step_delay: Duration,
    loaded: bool,
}

impl SyntheticBackend {
    /// Create a backend with a random initial seed.
    pub fn new() -> Self {
        Self::with_seed(rand::rng().random_range(0..=u32::MAX as i64))
    }

    /// Create a backend with a fixed initial seed.
    pub fn with_seed(seed: i64) -> Self {
        Self {
            seed,
            step_delay: Duration::ZERO,
            loaded: false,
        }
    }

    /// Sleep this long per step, to approximate a slow model.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffusionBackend for SyntheticBackend {
    fn load(&mut self) -> Result<(), EngineError> {
        // Nothing heavy to load; real backends read gigabytes of weights here.
        self.loaded = true;
        Ok(())
    }

    fn seed(&self) -> i64 {
        self.seed
    }

    fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn GenerationSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        if !self.loaded {
            return Err(EngineError::Execution("model is not loaded".into()));
        }

        for iteration in 0..request.iterations {
            // Each iteration gets its own seed so repeated images differ
            // and output filenames never collide.
            let seed = request.seed + i64::from(iteration);
            let image = render(seed, request.width, request.height);

            for step in 0..request.steps {
                if cancel.is_cancelled() {
                    tracing::info!(seed, step, "Generation cancelled at step boundary");
                    return Ok(RunOutcome::Cancelled);
                }
                if !self.step_delay.is_zero() {
                    thread::sleep(self.step_delay);
                }
                let preview = request.progress_images.then_some(&image);
                sink.on_step(step, preview);
            }

            sink.on_image(&image, seed, false);
            self.seed = seed;

            // Post-processing re-delivers the same seed with upscaled=true.
            if request.upscale.is_some() || request.face_restore_strength > 0.0 {
                let level = request.upscale.map_or(1, |u| u.level);
                let enhanced = render(seed, request.width * level, request.height * level);
                sink.on_image(&enhanced, seed, true);
            }
        }

        Ok(RunOutcome::Complete)
    }
}

/// Render a seeded noise-over-gradient image.
fn render(seed: i64, width: u32, height: u32) -> DynamicImage {
    let mut rng = StdRng::seed_from_u64(seed as u64);
    let tint: [u8; 3] = [rng.random(), rng.random(), rng.random()];
    let img = RgbImage::from_fn(width, height, |x, y| {
        let gx = (x * 255 / width.max(1)) as u8;
        let gy = (y * 255 / height.max(1)) as u8;
        Rgb([
            tint[0].wrapping_add(gx),
            tint[1].wrapping_add(gy),
            tint[2].wrapping_add(gx ^ gy),
        ])
    });
    DynamicImage::ImageRgb8(img)
}
