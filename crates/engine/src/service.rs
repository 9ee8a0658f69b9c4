//! The generator worker loop: the queue's single consumer.
//!
//! Pulls jobs in FIFO order, drives the blocking resource on a dedicated
//! blocking thread, and translates run callbacks into bus events tagged
//! with the job id. Every admitted job reaches exactly one terminal
//! event; job N's terminal event is always published before job N+1's
//! first progress event because there is only this one worker.

use std::sync::Arc;

use dream_events::{EventBus, GenerationEvent};
use image::DynamicImage;

use crate::queue::{Job, JobReceiver};
use crate::resource::{GenerationResource, GenerationSink, RunOutcome};
use crate::storage::ImageStorage;

/// The worker that owns the only [`GenerationResource`] handle.
pub struct GeneratorService {
    resource: GenerationResource,
    jobs: JobReceiver,
    bus: Arc<EventBus>,
    storage: Arc<ImageStorage>,
}

impl GeneratorService {
    pub fn new(
        resource: GenerationResource,
        jobs: JobReceiver,
        bus: Arc<EventBus>,
        storage: Arc<ImageStorage>,
    ) -> Self {
        Self {
            resource,
            jobs,
            bus,
            storage,
        }
    }

    /// Run until the queue is closed and drained.
    ///
    /// The resource handle moves into a blocking task for the duration of
    /// each job and back out afterwards; no other code can reach it, so
    /// `run` invocations can never overlap.
    pub async fn run(self) {
        let Self {
            mut resource,
            mut jobs,
            bus,
            storage,
        } = self;

        tracing::info!("Generator worker started");

        while let Some(job) = jobs.next().await {
            let cancel = jobs.begin(&job.id);
            let request_id = job.id.clone();
            tracing::info!(
                request_id = %request_id,
                prompt = %job.request.prompt,
                iterations = job.request.iterations,
                steps = job.request.steps,
                seed = job.request.seed,
                "Job started",
            );

            let run_bus = Arc::clone(&bus);
            let run_storage = Arc::clone(&storage);
            let handle = tokio::task::spawn_blocking(move || {
                let mut sink = PublishingSink::new(&job, &run_bus, &run_storage);
                let outcome = resource.run(&job.request, &mut sink, &cancel);
                let report = sink.into_report();
                (resource, outcome, report)
            });

            match handle.await {
                Ok((returned, outcome, report)) => {
                    resource = returned;
                    finish_job(&bus, &request_id, outcome, &report);
                }
                Err(join_err) => {
                    // The backend panicked and took the resource handle
                    // with it; the worker cannot serve further jobs.
                    tracing::error!(
                        request_id = %request_id,
                        error = %join_err,
                        "Generation task panicked, worker stopping",
                    );
                    bus.publish(GenerationEvent::Error {
                        request_id,
                        message: "internal generation failure".into(),
                    });
                    jobs.finish();

                    // Already-admitted jobs will never run; each still
                    // gets its terminal event so no listener waits
                    // forever. Closing first turns new submissions into
                    // QueueClosed instead of silent acceptance.
                    jobs.close();
                    while let Some(abandoned) = jobs.next().await {
                        tracing::warn!(request_id = %abandoned.id, "Discarding queued job after worker failure");
                        bus.publish(GenerationEvent::Error {
                            request_id: abandoned.id,
                            message: "generation worker stopped before this job could run".into(),
                        });
                    }
                    return;
                }
            }

            jobs.finish();
        }

        tracing::info!("Generator worker stopped");
    }
}

/// Publish the job's terminal event, unless the final primary `result`
/// already was it.
fn finish_job(
    bus: &EventBus,
    request_id: &str,
    outcome: Result<RunOutcome, crate::error::EngineError>,
    report: &RunReport,
) {
    match outcome {
        Ok(RunOutcome::Cancelled) => {
            tracing::info!(request_id = %request_id, images = report.primaries, "Job cancelled");
            bus.publish(GenerationEvent::Cancelled {
                request_id: request_id.to_string(),
            });
        }
        Ok(RunOutcome::Complete) => {
            if let Some(message) = &report.failure {
                tracing::error!(request_id = %request_id, error = %message, "Job failed during image persistence");
                bus.publish(GenerationEvent::Error {
                    request_id: request_id.to_string(),
                    message: message.clone(),
                });
            } else if report.primaries == 0 {
                // Should not happen with a conforming backend, but a
                // listener must never be left without a terminal event.
                bus.publish(GenerationEvent::Error {
                    request_id: request_id.to_string(),
                    message: "run completed without producing an image".into(),
                });
            } else {
                // The final `result` event was this job's terminal event.
                tracing::info!(request_id = %request_id, images = report.primaries, "Job completed");
            }
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Job failed");
            bus.publish(GenerationEvent::Error {
                request_id: request_id.to_string(),
                message: e.to_string(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// PublishingSink
// ---------------------------------------------------------------------------

/// What a run's callbacks produced, for terminal-event selection.
struct RunReport {
    /// Primary images persisted and announced.
    primaries: u32,
    /// First persistence failure, if any.
    failure: Option<String>,
}

/// Sink that persists primary images and publishes bus events.
///
/// Fractions are computed over the whole run (`iterations * steps`
/// total steps) so they are monotonically non-decreasing even for
/// multi-image jobs and equal `(step + 1) / steps` for single-image
/// jobs.
struct PublishingSink<'a> {
    job: &'a Job,
    bus: &'a EventBus,
    storage: &'a ImageStorage,
    prefix: String,
    total_steps: u64,
    images_done: u32,
    primaries: u32,
    failure: Option<String>,
}

impl<'a> PublishingSink<'a> {
    fn new(job: &'a Job, bus: &'a EventBus, storage: &'a ImageStorage) -> Self {
        Self {
            job,
            bus,
            storage,
            prefix: storage.unique_prefix(),
            total_steps: u64::from(job.request.iterations) * u64::from(job.request.steps),
            images_done: 0,
            primaries: 0,
            failure: None,
        }
    }

    fn into_report(self) -> RunReport {
        RunReport {
            primaries: self.primaries,
            failure: self.failure,
        }
    }
}

impl GenerationSink for PublishingSink<'_> {
    fn on_step(&mut self, step: u32, _preview: Option<&DynamicImage>) {
        let done =
            u64::from(self.images_done) * u64::from(self.job.request.steps) + u64::from(step) + 1;
        self.bus.publish(GenerationEvent::Progress {
            request_id: self.job.id.clone(),
            fraction: done as f64 / self.total_steps as f64,
        });
    }

    fn on_image(&mut self, image: &DynamicImage, seed: i64, upscaled: bool) {
        let name = format!("{}.{}.png", self.prefix, seed);
        let caption = format!("{} -S{}", self.job.request.prompt, seed);

        match self.storage.save(image, &name, &caption) {
            Ok(path) => {
                if upscaled {
                    // Enhancement of an already-announced result; the file
                    // is replaced in place, no new event.
                    tracing::debug!(request_id = %self.job.id, seed, "Upscaled image re-saved");
                } else {
                    self.images_done += 1;
                    self.primaries += 1;
                    self.bus.publish(GenerationEvent::Result {
                        request_id: self.job.id.clone(),
                        url: path.display().to_string(),
                        seed,
                    });
                }
            }
            Err(e) => {
                if upscaled {
                    // The primary result was already saved and announced;
                    // losing the enhancement does not unmake it.
                    tracing::warn!(request_id = %self.job.id, seed, error = %e, "Failed to re-save upscaled image");
                } else {
                    self.images_done += 1;
                    tracing::error!(request_id = %self.job.id, seed, error = %e, "Failed to persist image");
                    self.failure.get_or_insert_with(|| e.to_string());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use dream_core::request::GenerationRequest;
    use image::RgbImage;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn job(seed: i64) -> Job {
        let request = GenerationRequest::from_json(
            &json!({
                "prompt": "a cat",
                "iterations": 1,
                "steps": 1,
                "width": 64,
                "height": 64,
                "cfgScale": 7.5,
                "sampler": "k_lms",
                "seed": seed,
            }),
            false,
        )
        .unwrap();
        Job::assign(request, 0)
    }

    fn pixels() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
    }

    #[test]
    fn failed_upscale_resave_does_not_outlive_the_terminal_result() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(dir.path()).unwrap();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let job = job(7);

        let mut sink = PublishingSink::new(&job, &bus, &storage);
        sink.on_image(&pixels(), 7, false);

        // Sabotage the output directory so the enhancement re-save fails.
        std::fs::remove_dir_all(dir.path()).unwrap();
        sink.on_image(&pixels(), 7, true);

        let report = sink.into_report();
        assert_eq!(report.primaries, 1);
        assert!(report.failure.is_none(), "a lost enhancement must not fail the job");

        finish_job(&bus, &job.id, Ok(RunOutcome::Complete), &report);

        // Exactly one event: the primary result, which is the terminal.
        assert!(matches!(
            rx.try_recv().unwrap(),
            GenerationEvent::Result { .. }
        ));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn failed_primary_save_is_an_error_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(dir.path()).unwrap();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let job = job(7);

        let mut sink = PublishingSink::new(&job, &bus, &storage);
        std::fs::remove_dir_all(dir.path()).unwrap();
        sink.on_image(&pixels(), 7, false);

        let report = sink.into_report();
        assert_eq!(report.primaries, 0);
        assert!(report.failure.is_some());

        finish_job(&bus, &job.id, Ok(RunOutcome::Complete), &report);

        assert!(matches!(
            rx.try_recv().unwrap(),
            GenerationEvent::Error { .. }
        ));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
