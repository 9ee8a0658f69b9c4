//! End-to-end tests of the queue -> worker -> event-bus pipeline,
//! driven by the synthetic backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dream_core::request::GenerationRequest;
use dream_engine::backend::SyntheticBackend;
use dream_engine::{
    DiffusionBackend, EngineError, GenerationResource, GenerationSink, ImageStorage, Job,
    JobQueue, JobReceiver, RunOutcome,
};
use dream_events::{EventBus, GenerationEvent};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Receive the next event or fail the test after two seconds.
async fn next_event(rx: &mut broadcast::Receiver<GenerationEvent>) -> GenerationEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed unexpectedly")
}

/// Drain events for `id` until its terminal event, returning the whole
/// per-job sequence.
async fn drain_job(
    rx: &mut broadcast::Receiver<GenerationEvent>,
    id: &str,
) -> Vec<GenerationEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        if event.request_id() != id {
            continue;
        }
        let terminal = match &event {
            GenerationEvent::Progress { .. } => false,
            GenerationEvent::Result { .. } => true, // single-image jobs only in these helpers
            GenerationEvent::Cancelled { .. } | GenerationEvent::Error { .. } => true,
        };
        events.push(event);
        if terminal {
            return events;
        }
    }
}

struct Pipeline {
    queue: JobQueue,
    bus: Arc<EventBus>,
    outdir: tempfile::TempDir,
    worker: tokio::task::JoinHandle<()>,
}

fn start_pipeline(backend: Box<dyn DiffusionBackend>) -> Pipeline {
    let outdir = tempfile::tempdir().unwrap();
    let mut resource = GenerationResource::new(backend);
    resource.ensure_loaded().unwrap();

    let storage = Arc::new(ImageStorage::new(outdir.path()).unwrap());
    let bus = Arc::new(EventBus::default());
    let (queue, receiver) = JobQueue::new(8);

    let worker = spawn_worker(resource, receiver, Arc::clone(&bus), storage);
    Pipeline {
        queue,
        bus,
        outdir,
        worker,
    }
}

fn spawn_worker(
    resource: GenerationResource,
    receiver: JobReceiver,
    bus: Arc<EventBus>,
    storage: Arc<ImageStorage>,
) -> tokio::task::JoinHandle<()> {
    let service = dream_engine::GeneratorService::new(resource, receiver, bus, storage);
    tokio::spawn(service.run())
}

fn request(value: serde_json::Value) -> GenerationRequest {
    GenerationRequest::from_json(&value, false).unwrap()
}

fn cat_request(seed: i64, steps: u32) -> GenerationRequest {
    request(json!({
        "prompt": "a cat",
        "iterations": 1,
        "steps": steps,
        "width": 64,
        "height": 64,
        "cfgScale": 7.5,
        "sampler": "k_lms",
        "seed": seed,
    }))
}

// ---------------------------------------------------------------------------
// Scenario: one job, explicit seed
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn single_job_emits_one_progress_per_step_then_result() {
    let pipeline = start_pipeline(Box::new(SyntheticBackend::with_seed(0)));
    let mut rx = pipeline.bus.subscribe();

    let job = Job::assign(cat_request(42, 10), 0);
    let id = job.id.clone();
    pipeline.queue.enqueue(job).unwrap();

    let events = drain_job(&mut rx, &id).await;
    assert_eq!(events.len(), 11, "10 progress + 1 result, got {events:?}");

    for (i, event) in events[..10].iter().enumerate() {
        match event {
            GenerationEvent::Progress { fraction, .. } => {
                let expected = (i as f64 + 1.0) / 10.0;
                assert!(
                    (fraction - expected).abs() < 1e-9,
                    "step {i}: expected fraction {expected}, got {fraction}"
                );
            }
            other => panic!("expected progress at position {i}, got {other:?}"),
        }
    }

    match &events[10] {
        GenerationEvent::Result { url, seed, .. } => {
            assert_eq!(*seed, 42);
            assert!(url.ends_with(".42.png"), "unexpected url {url}");
            assert!(std::path::Path::new(url).exists());
        }
        other => panic!("expected terminal result, got {other:?}"),
    }

    // Nothing follows the terminal event.
    drop(pipeline.queue);
    pipeline.worker.await.unwrap();
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Closed | broadcast::error::TryRecvError::Empty)
    ));
}

// ---------------------------------------------------------------------------
// Seed resolution
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn sentinel_seed_resolves_from_the_seed_cell() {
    let backend = SyntheticBackend::with_seed(777);
    let mut resource = GenerationResource::new(Box::new(backend));
    resource.ensure_loaded().unwrap();
    let seed_cell = resource.seed_cell();
    assert_eq!(seed_cell.get(), 777);

    let outdir = tempfile::tempdir().unwrap();
    let storage = Arc::new(ImageStorage::new(outdir.path()).unwrap());
    let bus = Arc::new(EventBus::default());
    let (queue, receiver) = JobQueue::new(8);
    let worker = spawn_worker(resource, receiver, Arc::clone(&bus), storage);
    let mut rx = bus.subscribe();

    let job = Job::assign(cat_request(-1, 2), seed_cell.get());
    assert_eq!(job.request.seed, 777);
    assert!(job.id.ends_with(".777"));

    let id = job.id.clone();
    queue.enqueue(job).unwrap();

    let events = drain_job(&mut rx, &id).await;
    match events.last().unwrap() {
        GenerationEvent::Result { seed, .. } => assert_eq!(*seed, 777),
        other => panic!("expected result, got {other:?}"),
    }

    drop(queue);
    worker.await.unwrap();
}

// ---------------------------------------------------------------------------
// FIFO ordering
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn jobs_run_in_enqueue_order_with_terminal_barrier() {
    let pipeline = start_pipeline(Box::new(SyntheticBackend::with_seed(0)));
    let mut rx = pipeline.bus.subscribe();

    let a = Job::assign(cat_request(1, 3), 0);
    let b = Job::assign(cat_request(2, 3), 0);
    let (id_a, id_b) = (a.id.clone(), b.id.clone());
    pipeline.queue.enqueue(a).unwrap();
    pipeline.queue.enqueue(b).unwrap();

    // Collect everything through B's terminal event.
    let mut all = Vec::new();
    loop {
        let event = next_event(&mut rx).await;
        let done = event.request_id() == id_b && matches!(event, GenerationEvent::Result { .. });
        all.push(event);
        if done {
            break;
        }
    }

    let a_terminal = all
        .iter()
        .position(|e| e.request_id() == id_a && matches!(e, GenerationEvent::Result { .. }))
        .expect("job A should complete");
    let b_first = all
        .iter()
        .position(|e| e.request_id() == id_b)
        .expect("job B should emit events");
    assert!(
        a_terminal < b_first,
        "A's terminal event must precede B's first event"
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_the_running_job_leaves_the_queue_usable() {
    let backend = SyntheticBackend::with_seed(0).with_step_delay(Duration::from_millis(20));
    let pipeline = start_pipeline(Box::new(backend));
    let mut rx = pipeline.bus.subscribe();

    let a = Job::assign(cat_request(1, 500), 0);
    let b = Job::assign(cat_request(2, 2), 0);
    let (id_a, id_b) = (a.id.clone(), b.id.clone());
    pipeline.queue.enqueue(a).unwrap();
    pipeline.queue.enqueue(b).unwrap();

    // Wait until A is demonstrably running, then cancel it.
    let first = next_event(&mut rx).await;
    assert_eq!(first.request_id(), id_a);
    pipeline.queue.cancel_current();

    let a_events = drain_job(&mut rx, &id_a).await;
    assert!(
        matches!(a_events.last().unwrap(), GenerationEvent::Cancelled { .. }),
        "expected cancelled terminal for A, got {a_events:?}"
    );
    assert!(
        !a_events
            .iter()
            .any(|e| matches!(e, GenerationEvent::Result { .. })),
        "a cancelled single-image job must deliver no results"
    );

    // B was queued behind A and must still run to a normal result.
    let b_events = drain_job(&mut rx, &id_b).await;
    assert!(matches!(
        b_events.last().unwrap(),
        GenerationEvent::Result { .. }
    ));
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

/// Fails any request whose prompt contains "boom"; otherwise delegates.
struct FaultInjectingBackend {
    inner: SyntheticBackend,
}

impl DiffusionBackend for FaultInjectingBackend {
    fn load(&mut self) -> Result<(), EngineError> {
        self.inner.load()
    }
    fn seed(&self) -> i64 {
        self.inner.seed()
    }
    fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn GenerationSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        if request.prompt.contains("boom") {
            return Err(EngineError::Execution("CUDA out of memory".into()));
        }
        self.inner.generate(request, sink, cancel)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_job_reports_error_and_resource_stays_usable() {
    let pipeline = start_pipeline(Box::new(FaultInjectingBackend {
        inner: SyntheticBackend::with_seed(0),
    }));
    let mut rx = pipeline.bus.subscribe();

    let bad = Job::assign(
        request(json!({
            "prompt": "boom",
            "iterations": 1,
            "steps": 4,
            "width": 64,
            "height": 64,
            "cfgScale": 7.5,
            "sampler": "ddim",
            "seed": 1,
        })),
        0,
    );
    let good = Job::assign(cat_request(2, 2), 0);
    let (id_bad, id_good) = (bad.id.clone(), good.id.clone());
    pipeline.queue.enqueue(bad).unwrap();
    pipeline.queue.enqueue(good).unwrap();

    let bad_events = drain_job(&mut rx, &id_bad).await;
    assert_eq!(bad_events.len(), 1);
    assert!(
        matches!(&bad_events[0], GenerationEvent::Error { message, .. } if message.contains("CUDA")),
        "expected error terminal, got {bad_events:?}"
    );

    let good_events = drain_job(&mut rx, &id_good).await;
    assert!(matches!(
        good_events.last().unwrap(),
        GenerationEvent::Result { .. }
    ));
}

// ---------------------------------------------------------------------------
// Worker panic
// ---------------------------------------------------------------------------

/// Panics mid-generate, simulating a backend bug rather than a domain error.
struct PanickingBackend {
    inner: SyntheticBackend,
}

impl DiffusionBackend for PanickingBackend {
    fn load(&mut self) -> Result<(), EngineError> {
        self.inner.load()
    }
    fn seed(&self) -> i64 {
        self.inner.seed()
    }
    fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn GenerationSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        if request.prompt.contains("panic") {
            // Leave time for jobs behind this one to be admitted.
            std::thread::sleep(Duration::from_millis(100));
            panic!("backend bug");
        }
        self.inner.generate(request, sink, cancel)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_panic_gives_every_admitted_job_a_terminal_event() {
    let pipeline = start_pipeline(Box::new(PanickingBackend {
        inner: SyntheticBackend::with_seed(0),
    }));
    let mut rx = pipeline.bus.subscribe();

    let crashing = Job::assign(
        request(json!({
            "prompt": "panic",
            "iterations": 1,
            "steps": 4,
            "width": 64,
            "height": 64,
            "cfgScale": 7.5,
            "sampler": "ddim",
            "seed": 1,
        })),
        0,
    );
    let stranded = Job::assign(cat_request(2, 2), 0);
    let (id_crashing, id_stranded) = (crashing.id.clone(), stranded.id.clone());
    pipeline.queue.enqueue(crashing).unwrap();
    pipeline.queue.enqueue(stranded).unwrap();

    // The crashing job gets an error terminal.
    let events = drain_job(&mut rx, &id_crashing).await;
    assert!(
        matches!(events.last().unwrap(), GenerationEvent::Error { .. }),
        "expected error terminal for the crashing job, got {events:?}"
    );

    // The job queued behind it never runs but still gets its terminal.
    let events = drain_job(&mut rx, &id_stranded).await;
    assert_eq!(events.len(), 1);
    assert!(
        matches!(&events[0], GenerationEvent::Error { message, .. } if message.contains("before this job could run")),
        "expected error terminal for the queued job, got {events:?}"
    );

    // The queue is closed to further submissions.
    let err = pipeline
        .queue
        .enqueue(Job::assign(cat_request(3, 2), 0))
        .unwrap_err();
    assert!(matches!(err, EngineError::QueueClosed));
}

// ---------------------------------------------------------------------------
// Exclusivity
// ---------------------------------------------------------------------------

/// Panics the test (via the flag) if two generate calls ever overlap.
struct ExclusiveProbe {
    inner: SyntheticBackend,
    busy: Arc<AtomicBool>,
    violated: Arc<AtomicBool>,
}

impl DiffusionBackend for ExclusiveProbe {
    fn load(&mut self) -> Result<(), EngineError> {
        self.inner.load()
    }
    fn seed(&self) -> i64 {
        self.inner.seed()
    }
    fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn GenerationSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.violated.store(true, Ordering::SeqCst);
        }
        let result = self.inner.generate(request, sink, cancel);
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_enqueues_never_overlap_runs() {
    let violated = Arc::new(AtomicBool::new(false));
    let probe = ExclusiveProbe {
        inner: SyntheticBackend::with_seed(0).with_step_delay(Duration::from_millis(2)),
        busy: Arc::new(AtomicBool::new(false)),
        violated: Arc::clone(&violated),
    };
    let pipeline = start_pipeline(Box::new(probe));
    let mut rx = pipeline.bus.subscribe();

    let mut ids = Vec::new();
    let mut handles = Vec::new();
    for seed in 1..=5 {
        let job = Job::assign(cat_request(seed, 3), 0);
        ids.push(job.id.clone());
        let queue = pipeline.queue.clone();
        handles.push(tokio::spawn(async move { queue.enqueue(job) }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Await a terminal event per job, in whatever enqueue order won.
    let mut remaining: std::collections::HashSet<String> = ids.into_iter().collect();
    while !remaining.is_empty() {
        let event = next_event(&mut rx).await;
        if matches!(event, GenerationEvent::Result { .. }) {
            remaining.remove(event.request_id());
        }
    }

    assert!(
        !violated.load(Ordering::SeqCst),
        "two generate calls overlapped"
    );

    // Files landed in the output directory with distinct prefixes.
    let files = std::fs::read_dir(pipeline.outdir.path()).unwrap().count();
    assert!(files >= 5, "expected at least 5 output files, found {files}");
}
