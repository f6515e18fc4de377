//! Shared engine state: admission, dedup, dispatch and cancellation
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! await. Lock order is engine state, then cache index; the cache never
//! calls back into the engine.

use super::handle::JobHandle;
use super::job::{
    JobOutput, JobRecord, JobRequest, JobResult, JobState, JobWork, RunningJob, WaiterId,
};
use crate::cache::ResultCache;
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::Fingerprint;
use crate::ingest::{Ingestor, InputSource, RawImage};
use crate::storage::StorageBackend;
use crate::transform::{Transform, TransformParams};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

/// Where a waiter currently is
pub(crate) enum Waiter {
    /// Input still being fetched or validated
    Preparing(CancellationToken),
    /// Attached to the in-flight record for a fingerprint
    Attached(Fingerprint),
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub records: HashMap<Fingerprint, JobRecord>,
    pub queue: VecDeque<Fingerprint>,
    pub free_slots: Vec<usize>,
    pub waiters: HashMap<WaiterId, Waiter>,
    pub closed: bool,
}

impl EngineState {
    pub fn running(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == JobState::Running)
            .count()
    }

    /// Jobs on worker slots, longest running first
    pub fn running_jobs(&self) -> Vec<RunningJob> {
        let now = tokio::time::Instant::now();
        let mut jobs: Vec<RunningJob> = self
            .records
            .iter()
            .filter_map(|(fp, record)| record.running(*fp, now))
            .collect();
        jobs.sort_by(|a, b| b.running_ms.cmp(&a.running_ms));
        jobs
    }

    pub fn preparing(&self) -> usize {
        self.waiters
            .values()
            .filter(|w| matches!(w, Waiter::Preparing(_)))
            .count()
    }
}

pub(crate) struct EngineCore {
    pub storage: Arc<dyn StorageBackend>,
    pub cache: Option<ResultCache>,
    pub transform: Arc<dyn Transform>,
    pub ingestor: Arc<Ingestor>,
    pub workers: usize,
    pub timeout: Duration,
    pub allow_upsampling: bool,
    pub max_pixels: u64,
    pub fetch_permits: Semaphore,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    state: Mutex<EngineState>,
    next_waiter: AtomicU64,
    /// Completion signal of the most recent upload admission
    admission_tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl EngineCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        cache: Option<ResultCache>,
        transform: Arc<dyn Transform>,
        ingestor: Arc<Ingestor>,
        workers: usize,
        timeout: Duration,
        allow_upsampling: bool,
        max_pixels: u64,
    ) -> Self {
        let state = EngineState {
            // Popped from the back, so slot 0 is handed out first
            free_slots: (0..workers).rev().collect(),
            ..EngineState::default()
        };
        Self {
            storage,
            cache,
            transform,
            ingestor,
            workers,
            timeout,
            allow_upsampling,
            max_pixels,
            fetch_permits: Semaphore::new(workers),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            state: Mutex::new(state),
            next_waiter: AtomicU64::new(1),
            admission_tail: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(self: &Arc<Self>, request: JobRequest) -> JobHandle {
        let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let handle = JobHandle::new(request.id, waiter, rx, Arc::downgrade(self));
        let token = self.shutdown.child_token();

        {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                let _ = tx.send(Err(ForgeError::ShuttingDown));
                return handle;
            }
            state
                .waiters
                .insert(waiter, Waiter::Preparing(token.clone()));
        }
        debug!("Submitted request {} ({:?})", request.id, request.source);

        match request.source {
            InputSource::Upload {
                bytes,
                declared_mime,
            } => {
                self.spawn_upload(waiter, tx, request.id, bytes, declared_mime, request.params);
            }
            InputSource::Url(url) => {
                self.spawn_fetch(waiter, tx, request.id, url, request.params, token);
            }
        }
        handle
    }

    /// Validate and fingerprint an upload off the caller's thread
    ///
    /// Hashing runs in parallel, but each upload waits for the one submitted
    /// before it to be admitted, so uploads reach the queue in submission
    /// order.
    fn spawn_upload(
        self: &Arc<Self>,
        waiter: WaiterId,
        tx: oneshot::Sender<JobResult>,
        request_id: Uuid,
        bytes: Bytes,
        declared_mime: Option<String>,
        params: TransformParams,
    ) {
        let (admitted, turn) = oneshot::channel::<()>();
        let previous = self
            .admission_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(turn);

        let core = Arc::clone(self);
        self.tracker.spawn(async move {
            let worker = Arc::clone(&core);
            let prepared = tokio::task::spawn_blocking(move || {
                worker
                    .ingestor
                    .ingest_upload(bytes, declared_mime)
                    .and_then(|raw| worker.prepare(raw, &params))
            })
            .await
            .unwrap_or_else(|join| {
                Err(ForgeError::Internal(format!(
                    "upload validation panicked: {}",
                    join
                )))
            });

            if let Some(previous) = previous {
                // Resolves when the earlier admission finishes either way
                let _ = previous.await;
            }
            core.admit(waiter, tx, request_id, prepared);
            drop(admitted);
        });
    }

    fn spawn_fetch(
        self: &Arc<Self>,
        waiter: WaiterId,
        tx: oneshot::Sender<JobResult>,
        request_id: Uuid,
        url: String,
        params: TransformParams,
        token: CancellationToken,
    ) {
        let core = Arc::clone(self);
        self.tracker.spawn(async move {
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = core.fetch(&url) => Some(result),
            };
            match fetched {
                Some(input) => {
                    let prepared = input.and_then(|raw| core.prepare(raw, &params));
                    core.admit(waiter, tx, request_id, prepared);
                }
                None => {
                    debug!("Fetch of {} abandoned", url);
                    core.settle(waiter, tx, Err(ForgeError::Cancelled));
                }
            }
        });
    }

    async fn fetch(&self, url: &str) -> ForgeResult<RawImage> {
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| ForgeError::ShuttingDown)?;
        self.ingestor.fetch_url(url).await
    }

    /// Normalize, enforce output limits and fingerprint
    pub fn prepare(
        &self,
        input: RawImage,
        params: &TransformParams,
    ) -> ForgeResult<(Fingerprint, JobWork)> {
        let params = params.normalize(&input.info, self.allow_upsampling)?;
        let cost = self.transform.cost(&input.info, &params);
        if cost.output_pixels > self.max_pixels {
            return Err(ForgeError::TooManyPixels {
                megapixels: cost.output_pixels as f64 / 1_000_000.0,
                limit: self.max_pixels as f64 / 1_000_000.0,
            });
        }
        let fp = Fingerprint::compute(
            &input.content_hash,
            self.transform.name(),
            self.transform.version(),
            &params,
        );
        Ok((fp, JobWork { input, params }))
    }

    /// Deliver a result to a waiter that never reached a job record
    fn settle(&self, waiter: WaiterId, tx: oneshot::Sender<JobResult>, result: JobResult) {
        self.lock().waiters.remove(&waiter);
        let _ = tx.send(result);
    }

    /// Route a prepared input: attach, serve from cache, or enqueue
    fn admit(
        self: &Arc<Self>,
        waiter: WaiterId,
        tx: oneshot::Sender<JobResult>,
        request_id: Uuid,
        prepared: ForgeResult<(Fingerprint, JobWork)>,
    ) {
        let (fp, work) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!("Request {} rejected: {}", request_id, e);
                self.settle(waiter, tx, Err(e));
                return;
            }
        };

        let mut state = self.lock();
        if !matches!(state.waiters.get(&waiter), Some(Waiter::Preparing(_))) {
            debug!("Request {} cancelled before admission", request_id);
            return;
        }
        if state.closed {
            state.waiters.remove(&waiter);
            drop(state);
            let _ = tx.send(Err(ForgeError::ShuttingDown));
            return;
        }

        if let Some(record) = state.records.get_mut(&fp) {
            record.waiters.insert(waiter, tx);
            info!(
                "Request {} joined {} job {} ({} waiting)",
                request_id,
                record.state,
                fp.short(),
                record.waiters.len()
            );
            state.waiters.insert(waiter, Waiter::Attached(fp));
            return;
        }

        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.lookup(&fp) {
                cache.touch(&fp);
                state.waiters.remove(&waiter);
                drop(state);
                debug!("Cache hit for {}", fp.short());
                let _ = tx.send(Ok(JobOutput::from_entry(&entry, true)));
                return;
            }
            debug!("Cache miss for {}", fp.short());
        }

        let mut record = JobRecord::new(request_id, work);
        record.waiters.insert(waiter, tx);
        state.records.insert(fp, record);
        state.waiters.insert(waiter, Waiter::Attached(fp));
        state.queue.push_back(fp);
        info!(
            "Job {} queued for request {} (queue depth {})",
            fp.short(),
            request_id,
            state.queue.len()
        );
        self.dispatch(&mut state);
    }

    /// Start queued jobs while worker slots are free, oldest first
    pub fn dispatch(self: &Arc<Self>, state: &mut EngineState) {
        while !state.free_slots.is_empty() {
            let Some(fp) = state.queue.pop_front() else {
                break;
            };
            let Some(record) = state.records.get_mut(&fp) else {
                continue;
            };
            let Some(work) = record.work.take() else {
                continue;
            };
            let Some(slot) = state.free_slots.pop() else {
                break;
            };
            record.start(slot);
            info!(
                "Job {} ({}) running on slot {} after {:?} queued",
                fp.short(),
                record.job_id,
                slot,
                record.admitted_at.elapsed()
            );

            let core = Arc::clone(self);
            let cancel = record.cancel.clone();
            self.tracker.spawn(async move {
                core.run(fp, slot, work, cancel).await;
            });
        }
    }

    /// Detach one waiter, cancelling its job if it was the last and the job
    /// has not started
    pub fn cancel_waiter(&self, waiter: WaiterId) {
        let mut state = self.lock();
        match state.waiters.remove(&waiter) {
            None => {}
            Some(Waiter::Preparing(token)) => {
                debug!("Waiter {} cancelled while preparing input", waiter);
                token.cancel();
            }
            Some(Waiter::Attached(fp)) => {
                let Some(record) = state.records.get_mut(&fp) else {
                    return;
                };
                record.waiters.remove(&waiter);
                if record.waiters.is_empty() && record.transition(JobState::Cancelled) {
                    state.records.remove(&fp);
                    state.queue.retain(|queued| *queued != fp);
                    info!("Job {} cancelled before start", fp.short());
                } else {
                    debug!(
                        "Waiter {} left job {} ({} remaining)",
                        waiter,
                        fp.short(),
                        record.waiters.len()
                    );
                }
            }
        }
    }

    /// Close admission and cancel everything that has not started
    ///
    /// Returns the senders of waiters whose jobs were cancelled.
    pub fn close(&self) -> Vec<oneshot::Sender<JobResult>> {
        let mut state = self.lock();
        state.closed = true;
        let mut senders = Vec::new();
        let pending: Vec<Fingerprint> = state.queue.drain(..).collect();
        for fp in pending {
            if let Some(mut record) = state.records.remove(&fp) {
                record.transition(JobState::Cancelled);
                for (id, tx) in record.waiters.drain() {
                    state.waiters.remove(&id);
                    senders.push(tx);
                }
            }
        }
        senders
    }
}
