//! Job engine
//!
//! Accepts transform requests, collapses identical in-flight work onto one
//! execution, serves repeats from the result cache, and runs the rest on a
//! fixed pool of worker slots with a per-job deadline.
//!
//! # Job lifecycle
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | - | Pending | first request for a fingerprint misses the cache |
//! | Pending | Running | a worker slot frees up and the job is oldest in the queue |
//! | Pending | Cancelled | its last waiter cancels, or the engine shuts down |
//! | Running | Succeeded | output stored and recorded |
//! | Running | Failed | transform error, timeout, or storage error |
//!
//! A record leaves the in-flight table as soon as it reaches a terminal
//! state; every waiter attached at that moment receives the same result.

mod handle;
mod job;
mod scheduler;
mod worker;

pub use handle::JobHandle;
pub use job::{JobOutput, JobRequest, JobResult, JobState, RunningJob};

use self::scheduler::EngineCore;
use crate::audit::AuditLog;
use crate::cache::{sweep_uncached, CacheStats, RestoreSummary, ResultCache};
use crate::config::Config;
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::Fingerprint;
use crate::ingest::{Ingestor, RawImage};
use crate::storage::{create_backend, validate_key, StorageBackend};
use crate::transform::{ImageTransform, Transform, TransformParams};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub workers: usize,
    pub running: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub free_slots: usize,
    /// Submissions still fetching or validating their input
    pub preparing: usize,
    /// Age of the longest running job
    pub oldest_running_ms: Option<u64>,
    pub closed: bool,
    pub cache: Option<CacheStats>,
}

/// Bounded-concurrency transform engine
///
/// Cheap to clone; clones share the same pool, queue and cache. Submission
/// must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct JobEngine {
    core: Arc<EngineCore>,
    /// Age after which untracked outputs are swept at startup
    output_ttl: Duration,
}

impl JobEngine {
    /// Assemble an engine from its collaborators
    pub fn new(
        config: &Config,
        storage: Arc<dyn StorageBackend>,
        transform: Arc<dyn Transform>,
        ingestor: Ingestor,
    ) -> Self {
        let cache = config.cache.enabled.then(|| {
            ResultCache::new(
                Arc::clone(&storage),
                config.cache.max_size_bytes(),
                config.cache.ttl(),
            )
        });
        info!(
            "Job engine: {} worker(s), {} ms timeout, cache {}",
            config.jobs.max_concurrent_jobs,
            config.jobs.processing_timeout_ms,
            if cache.is_some() { "on" } else { "off" }
        );

        Self {
            core: Arc::new(EngineCore::new(
                storage,
                cache,
                transform,
                Arc::new(ingestor),
                config.jobs.max_concurrent_jobs.max(1),
                config.jobs.processing_timeout(),
                config.limits.allow_upsampling,
                config.limits.max_pixels(),
            )),
            output_ttl: config.cache.ttl(),
        }
    }

    /// Build the configured storage backend, raster transform and ingestor
    pub async fn from_config(config: &Config, audit: Arc<AuditLog>) -> ForgeResult<Self> {
        let storage = create_backend(&config.storage).await?;
        let transform = Arc::new(ImageTransform::new(config.limits.max_pixels()));
        let ingestor = Ingestor::new(&config.limits, &config.ingest, audit)?;
        let engine = Self::new(config, storage, transform, ingestor);
        engine.recover().await;
        Ok(engine)
    }

    /// Reconcile with outputs left in storage by earlier processes
    ///
    /// With the cache on, saved entries are re-indexed and the index is
    /// trimmed to the budget; otherwise stale outputs are swept. Failures are
    /// logged and the engine starts with whatever was recovered.
    pub async fn recover(&self) -> RestoreSummary {
        let storage = self.core.storage.as_ref();
        let recovered = match &self.core.cache {
            Some(cache) => cache.restore().await,
            None => sweep_uncached(storage, self.output_ttl).await,
        };
        recovered.unwrap_or_else(|e| {
            warn!("Could not reconcile stored outputs: {}", e);
            RestoreSummary::default()
        })
    }

    /// Submit a request; returns without waiting for input or execution
    pub fn submit(&self, request: JobRequest) -> JobHandle {
        self.core.submit(request)
    }

    /// Fingerprint a validated input the way submission would
    pub fn fingerprint(&self, input: &RawImage, params: &TransformParams) -> ForgeResult<Fingerprint> {
        self.core.prepare(input.clone(), params).map(|(fp, _)| fp)
    }

    /// State of the in-flight job for a fingerprint, if any
    pub fn job_state(&self, fp: &Fingerprint) -> Option<JobState> {
        self.core.lock().records.get(fp).map(|r| r.state)
    }

    /// Jobs waiting for a worker slot
    pub fn queue_depth(&self) -> usize {
        self.core.lock().queue.len()
    }

    /// Jobs holding worker slots, longest running first
    pub fn running_jobs(&self) -> Vec<RunningJob> {
        self.core.lock().running_jobs()
    }

    /// Deadline applied to each running job
    pub fn job_timeout(&self) -> Duration {
        self.core.timeout
    }

    pub fn stats(&self) -> EngineStats {
        let cache = self.core.cache.as_ref().map(ResultCache::stats);
        let state = self.core.lock();
        let oldest_running_ms = state.running_jobs().first().map(|job| job.running_ms);
        EngineStats {
            workers: self.core.workers,
            running: state.running(),
            pending: state.queue.len(),
            in_flight: state.records.len(),
            free_slots: state.free_slots.len(),
            preparing: state.preparing(),
            oldest_running_ms,
            closed: state.closed,
            cache,
        }
    }

    /// Read a stored output by key
    pub async fn fetch_output(&self, key: &str) -> ForgeResult<Bytes> {
        validate_key(key)?;
        self.core.storage.get(key).await
    }

    /// Drop expired cache entries; zero when the cache is off
    pub async fn purge_cache(&self) -> ForgeResult<usize> {
        match &self.core.cache {
            Some(cache) => cache.purge_expired().await,
            None => Ok(0),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.core.storage
    }

    /// Stop accepting work and drain
    ///
    /// Pending jobs and input fetches are cancelled; running jobs finish
    /// (bounded by the job timeout) before this returns.
    pub async fn shutdown(&self) {
        let cancelled = self.core.close();
        info!(
            "Shutting down job engine ({} pending waiter(s) cancelled)",
            cancelled.len()
        );
        for tx in cancelled {
            let _ = tx.send(Err(ForgeError::Cancelled));
        }
        self.core.shutdown.cancel();
        self.core.fetch_permits.close();
        self.core.tracker.close();
        self.core.tracker.wait().await;
        if let Some(cache) = &self.core.cache {
            cache.flush().await;
        }
        info!("Job engine stopped");
    }
}

#[cfg(test)]
mod tests;
