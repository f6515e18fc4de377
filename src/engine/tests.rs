use super::*;
use crate::error::ErrorKind;
use crate::fingerprint::OUTPUT_PREFIX;
use crate::fixtures;
use crate::storage::testing::MemoryStorage;
use crate::transform::{NormalizedParams, Operation, ResizeFit, TransformOutput};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Blocks transforms until opened; lets tests hold jobs in Running
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self, cancel: &CancellationToken) -> ForgeResult<()> {
        let mut open = self.open.lock().unwrap();
        while !*open {
            if cancel.is_cancelled() {
                return Err(ForgeError::Cancelled);
            }
            open = self
                .cv
                .wait_timeout(open, Duration::from_millis(5))
                .unwrap()
                .0;
        }
        Ok(())
    }
}

/// Records calls by input width; hangs on `hang_width` until cancelled
struct ScriptedTransform {
    gate: Gate,
    calls: Mutex<Vec<u32>>,
    fail: bool,
    hang_width: Option<u32>,
    saw_cancel: AtomicBool,
}

impl ScriptedTransform {
    fn new(gate_open: bool) -> Arc<Self> {
        Arc::new(Self::with_gate(gate_open))
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::with_gate(true)
        })
    }

    fn hanging_on(width: u32) -> Arc<Self> {
        Arc::new(Self {
            hang_width: Some(width),
            ..Self::with_gate(true)
        })
    }

    fn with_gate(open: bool) -> Self {
        Self {
            gate: Gate::new(open),
            calls: Mutex::new(Vec::new()),
            fail: false,
            hang_width: None,
            saw_cancel: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transform for ScriptedTransform {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn version(&self) -> u32 {
        1
    }

    fn apply(
        &self,
        input: &RawImage,
        params: &NormalizedParams,
        cancel: &CancellationToken,
    ) -> ForgeResult<TransformOutput> {
        self.calls.lock().unwrap().push(input.info.width);

        if self.hang_width == Some(input.info.width) {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            self.saw_cancel.store(true, Ordering::SeqCst);
            return Err(ForgeError::Cancelled);
        }

        self.gate.wait(cancel)?;
        if self.fail {
            return Err(ForgeError::Transform {
                transform: "scripted".to_string(),
                reason: "boom".to_string(),
            });
        }
        Ok(TransformOutput {
            bytes: Bytes::from(format!("{}x{}", params.width, params.height)),
            format: params.format,
            width: params.width,
            height: params.height,
        })
    }
}

fn config(workers: usize) -> Config {
    let mut config = Config::default();
    config.jobs.max_concurrent_jobs = workers;
    config.jobs.processing_timeout_ms = 5_000;
    config
}

fn engine_over(
    config: &Config,
    storage: Arc<MemoryStorage>,
    transform: Arc<ScriptedTransform>,
) -> JobEngine {
    let ingestor = Ingestor::new(
        &config.limits,
        &config.ingest,
        Arc::new(AuditLog::disabled()),
    )
    .unwrap();
    JobEngine::new(config, storage, transform, ingestor)
}

fn engine_with(
    config: &Config,
    transform: Arc<ScriptedTransform>,
) -> (JobEngine, Arc<MemoryStorage>) {
    let storage = MemoryStorage::new();
    let engine = engine_over(config, storage.clone(), transform);
    (engine, storage)
}

fn grayscale() -> TransformParams {
    TransformParams::new(Operation::Grayscale)
}

fn upload(width: u32, height: u32) -> JobRequest {
    JobRequest::upload(fixtures::png(width, height), None, grayscale())
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Wait until every submission has been validated and routed
async fn admitted(engine: &JobEngine) {
    eventually("submissions to be admitted", || engine.stats().preparing == 0).await;
}

#[tokio::test]
async fn upload_is_validated_off_the_submitting_task() {
    let transform = ScriptedTransform::new(true);
    let (engine, _storage) = engine_with(&config(1), transform.clone());

    let handle = engine.submit(upload(16, 16));
    let stats = engine.stats();
    assert_eq!(stats.preparing, 1);
    assert_eq!(stats.in_flight, 0);

    handle.wait().await.unwrap();
    assert_eq!(engine.stats().preparing, 0);
}

#[tokio::test]
async fn identical_requests_share_one_execution() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(4), transform.clone());

    let handles: Vec<_> = (0..3).map(|_| engine.submit(upload(16, 16))).collect();
    admitted(&engine).await;
    let stats = engine.stats();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.running, 1);

    transform.gate.open();
    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.wait().await.unwrap());
    }
    assert_eq!(transform.calls().len(), 1);
    assert!(outputs.iter().all(|o| o == &outputs[0]));
    assert_eq!(engine.stats().in_flight, 0);
}

#[tokio::test]
async fn repeat_request_served_from_cache() {
    let transform = ScriptedTransform::new(true);
    let (engine, storage) = engine_with(&config(2), transform.clone());

    let first = engine.submit(upload(16, 16)).wait().await.unwrap();
    assert!(!first.cache_hit);
    assert!(first.cached);
    assert!(storage.contains(&first.storage_key));

    let second = engine.submit(upload(16, 16)).wait().await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.storage_key, first.storage_key);
    assert_eq!(transform.calls().len(), 1);
    assert_eq!(
        &engine.fetch_output(&first.storage_key).await.unwrap()[..],
        b"16x16"
    );
}

#[tokio::test]
async fn excess_jobs_queue_until_a_slot_frees() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(2), transform.clone());

    let handles: Vec<_> = [10, 11, 12]
        .into_iter()
        .map(|w| engine.submit(upload(w, 8)))
        .collect();
    admitted(&engine).await;
    let stats = engine.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.free_slots, 0);
    assert_eq!(engine.queue_depth(), 1);

    transform.gate.open();
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(engine.stats().free_slots, 2);
}

#[tokio::test]
async fn queued_jobs_dispatch_in_submission_order() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(1), transform.clone());

    let handles: Vec<_> = [21, 22, 23, 24]
        .into_iter()
        .map(|w| engine.submit(upload(w, 4)))
        .collect();
    transform.gate.open();
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(transform.calls(), vec![21, 22, 23, 24]);
}

#[tokio::test]
async fn large_upload_keeps_its_place_in_line() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(1), transform.clone());

    let handles: Vec<_> = [(20, 4), (900, 900), (25, 4), (26, 4)]
        .into_iter()
        .map(|(w, h)| engine.submit(upload(w, h)))
        .collect();
    transform.gate.open();
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(transform.calls(), vec![20, 900, 25, 26]);
}

#[tokio::test]
async fn timeout_fails_job_and_frees_slot() {
    let transform = ScriptedTransform::hanging_on(13);
    let mut config = config(1);
    config.jobs.processing_timeout_ms = 50;
    let (engine, _storage) = engine_with(&config, transform.clone());

    let stuck = engine.submit(upload(13, 4));
    let next = engine.submit(upload(14, 4));

    let err = stuck.wait().await.unwrap_err();
    assert!(matches!(err, ForgeError::Timeout { timeout_ms: 50 }));
    assert_eq!(err.kind(), ErrorKind::Timeout);

    next.wait().await.unwrap();
    eventually("transform to observe cancellation", || {
        transform.saw_cancel.load(Ordering::SeqCst)
    })
    .await;
}

#[tokio::test]
async fn failure_reaches_every_waiter_and_is_not_cached() {
    let transform = ScriptedTransform::failing();
    let (engine, storage) = engine_with(&config(2), transform.clone());

    let a = engine.submit(upload(16, 16));
    let b = engine.submit(upload(16, 16));
    for handle in [a, b] {
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transform);
    }
    assert_eq!(engine.stats().cache.unwrap().entries, 0);
    assert_eq!(storage.len(), 0);

    let err = engine.submit(upload(16, 16)).wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transform);
    assert!(transform.calls().len() >= 2);
}

#[tokio::test]
async fn pending_job_cancelled_when_last_waiter_leaves() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(1), transform.clone());
    let queued_fp = engine
        .fingerprint(&fixtures::raw_png(31, 4), &grayscale())
        .unwrap();

    let running = engine.submit(upload(30, 4));
    let first = engine.submit(upload(31, 4));
    let second = engine.submit(upload(31, 4));
    admitted(&engine).await;
    assert_eq!(engine.job_state(&queued_fp), Some(JobState::Pending));

    first.cancel();
    assert_eq!(engine.job_state(&queued_fp), Some(JobState::Pending));

    drop(second);
    assert_eq!(engine.job_state(&queued_fp), None);
    assert_eq!(engine.queue_depth(), 0);

    transform.gate.open();
    running.wait().await.unwrap();
    assert_eq!(transform.calls(), vec![30]);
}

#[tokio::test]
async fn running_job_survives_waiter_cancellation() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(1), transform.clone());
    let fp = engine
        .fingerprint(&fixtures::raw_png(40, 4), &grayscale())
        .unwrap();

    let handle = engine.submit(upload(40, 4));
    admitted(&engine).await;
    handle.cancel();
    assert_eq!(engine.job_state(&fp), Some(JobState::Running));

    transform.gate.open();
    eventually("job to finish", || engine.job_state(&fp).is_none()).await;

    let hit = engine.submit(upload(40, 4)).wait().await.unwrap();
    assert!(hit.cache_hit);
    assert_eq!(transform.calls().len(), 1);
}

#[tokio::test]
async fn abandoning_wait_cancels_waiter() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(1), transform.clone());
    let fp = engine
        .fingerprint(&fixtures::raw_png(51, 4), &grayscale())
        .unwrap();

    let running = engine.submit(upload(50, 4));
    let queued = engine.submit(upload(51, 4));
    admitted(&engine).await;
    assert_eq!(engine.job_state(&fp), Some(JobState::Pending));
    let waited = tokio::time::timeout(Duration::from_millis(20), queued.wait()).await;
    assert!(waited.is_err());
    assert_eq!(engine.job_state(&fp), None);

    transform.gate.open();
    running.wait().await.unwrap();
}

#[tokio::test]
async fn disabled_cache_still_stores_outputs() {
    let transform = ScriptedTransform::new(true);
    let mut config = config(2);
    config.cache.enabled = false;
    let (engine, storage) = engine_with(&config, transform.clone());

    let first = engine.submit(upload(16, 16)).wait().await.unwrap();
    let second = engine.submit(upload(16, 16)).wait().await.unwrap();
    assert!(!first.cached && !second.cache_hit);
    assert_eq!(transform.calls().len(), 2);
    assert!(storage.contains(&first.storage_key));
    assert!(engine.stats().cache.is_none());
}

#[tokio::test]
async fn output_larger_than_cache_is_stored_uncached() {
    let transform = ScriptedTransform::new(true);
    let mut config = config(1);
    config.cache.max_size_mb = 0.000_001;
    let (engine, storage) = engine_with(&config, transform);

    let output = engine.submit(upload(16, 16)).wait().await.unwrap();
    assert!(!output.cached);
    assert!(storage.contains(&output.storage_key));
    assert_eq!(engine.stats().cache.unwrap().entries, 0);
}

#[tokio::test]
async fn oversized_output_rejected_before_queueing() {
    let transform = ScriptedTransform::new(true);
    let mut config = config(1);
    config.limits.allow_upsampling = true;
    config.limits.max_megapixels = 0.01;
    let (engine, _storage) = engine_with(&config, transform.clone());

    let request = JobRequest::upload(
        fixtures::png(50, 50),
        None,
        TransformParams::new(Operation::Resize {
            width: 200,
            height: 200,
            fit: ResizeFit::Fill,
        }),
    );
    let err = engine.submit(request).wait().await.unwrap_err();
    assert!(matches!(err, ForgeError::TooManyPixels { .. }));
    assert!(transform.calls().is_empty());
}

#[tokio::test]
async fn invalid_upload_fails_without_a_job() {
    let transform = ScriptedTransform::new(true);
    let (engine, _storage) = engine_with(&config(1), transform.clone());

    let request = JobRequest::upload(Bytes::from_static(b"not an image"), None, grayscale());
    let err = engine.submit(request).wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(engine.stats().in_flight, 0);
}

#[tokio::test]
async fn blocked_url_surfaces_ssrf_error() {
    let transform = ScriptedTransform::new(true);
    let (engine, _storage) = engine_with(&config(1), transform.clone());

    let request = JobRequest::url("http://127.0.0.1/secret.png", grayscale());
    let err = engine.submit(request).wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SsrfBlocked);
    assert!(transform.calls().is_empty());
    assert_eq!(engine.stats().preparing, 0);
}

#[tokio::test]
async fn shutdown_cancels_pending_and_drains_running() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(1), transform.clone());

    let running = engine.submit(upload(60, 4));
    let pending = engine.submit(upload(61, 4));
    admitted(&engine).await;

    let stopper = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.shutdown().await })
    };

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, ForgeError::Cancelled));

    transform.gate.open();
    stopper.await.unwrap();
    running.wait().await.unwrap();

    let err = engine.submit(upload(62, 4)).wait().await.unwrap_err();
    assert!(matches!(err, ForgeError::ShuttingDown));
    assert!(engine.stats().closed);
    assert_eq!(transform.calls(), vec![60]);
}

#[tokio::test]
async fn stalled_storage_write_counts_against_the_deadline() {
    let transform = ScriptedTransform::new(true);
    let mut config = config(1);
    config.jobs.processing_timeout_ms = 50;
    let (engine, storage) = engine_with(&config, transform.clone());

    storage.hang_puts.store(true, Ordering::SeqCst);
    let err = engine.submit(upload(70, 4)).wait().await.unwrap_err();
    assert!(matches!(err, ForgeError::Timeout { timeout_ms: 50 }));
    assert_eq!(engine.stats().free_slots, 1);
    assert!(engine.running_jobs().is_empty());
    assert_eq!(engine.stats().cache.unwrap().entries, 0);

    storage.hang_puts.store(false, Ordering::SeqCst);
    let output = engine.submit(upload(71, 4)).wait().await.unwrap();
    assert!(storage.contains(&output.storage_key));
}

#[tokio::test]
async fn running_jobs_report_their_slot() {
    let transform = ScriptedTransform::new(false);
    let (engine, _storage) = engine_with(&config(2), transform.clone());

    let handle = engine.submit(upload(80, 4));
    let request_id = handle.request_id();
    admitted(&engine).await;

    let running = engine.running_jobs();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].job_id, request_id);
    assert_eq!(running[0].slot, 0);
    assert!(engine.stats().oldest_running_ms.is_some());

    transform.gate.open();
    handle.wait().await.unwrap();
    assert!(engine.running_jobs().is_empty());
    assert_eq!(engine.stats().oldest_running_ms, None);
}

#[tokio::test]
async fn restarted_engine_reuses_and_bounds_stored_outputs() {
    let transform = ScriptedTransform::new(true);
    let mut config = config(1);
    // Scripted outputs are "WxH": 5 bytes here, so two fit
    config.cache.max_size_mb = 12.0 / (1024.0 * 1024.0);
    let storage = MemoryStorage::new();

    for round in 0..3u32 {
        let engine = engine_over(&config, storage.clone(), transform.clone());
        let recovered = engine.recover().await;
        assert_eq!(recovered.adopted, if round == 0 { 0 } else { 2 });

        let repeat = engine.submit(upload(10, 10)).wait().await.unwrap();
        assert_eq!(repeat.cache_hit, round > 0);
        engine.submit(upload(20 + round, 10)).wait().await.unwrap();
        engine.shutdown().await;

        assert!(
            storage.bytes_under(OUTPUT_PREFIX) <= 12,
            "round {} left {} bytes",
            round,
            storage.bytes_under(OUTPUT_PREFIX)
        );
    }
    assert_eq!(transform.calls().iter().filter(|w| **w == 10).count(), 1);
}

#[tokio::test]
async fn disabled_cache_sweeps_stale_outputs_on_recovery() {
    let transform = ScriptedTransform::new(true);
    let mut config = config(1);
    config.cache.enabled = false;
    config.cache.ttl_seconds = 60;
    let (engine, storage) = engine_with(&config, transform);

    let output = engine.submit(upload(16, 16)).wait().await.unwrap();
    engine.shutdown().await;
    storage.backdate(&output.storage_key, Duration::from_secs(120));

    let restarted = engine_over(&config, storage.clone(), ScriptedTransform::new(true));
    assert_eq!(restarted.recover().await.removed, 1);
    assert!(!storage.contains(&output.storage_key));
}
