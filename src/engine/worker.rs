//! Job execution on a worker slot

use super::scheduler::EngineCore;
use super::job::{JobOutput, JobResult, JobState, JobWork};
use crate::cache::OutputMeta;
use crate::error::ForgeError;
use crate::fingerprint::Fingerprint;
use crate::transform::TransformOutput;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl EngineCore {
    /// Run one job to completion and fan the result out
    pub(super) async fn run(
        self: Arc<Self>,
        fp: Fingerprint,
        slot: usize,
        work: JobWork,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let result = self.execute(fp, work, &cancel).await;

        let waiters = {
            let mut state = self.lock();
            state.free_slots.push(slot);
            let waiters = match state.records.remove(&fp) {
                Some(mut record) => {
                    record.transition(if result.is_ok() {
                        JobState::Succeeded
                    } else {
                        JobState::Failed
                    });
                    for id in record.waiters.keys() {
                        state.waiters.remove(id);
                    }
                    record.waiters
                }
                None => HashMap::new(),
            };
            self.dispatch(&mut state);
            waiters
        };

        match &result {
            Ok(output) => info!(
                "Job {} succeeded in {:?}: {} ({}), {} waiter(s)",
                fp.short(),
                started.elapsed(),
                output.storage_key,
                output.size_display(),
                waiters.len()
            ),
            Err(e) => warn!(
                "Job {} failed after {:?}: {}, {} waiter(s)",
                fp.short(),
                started.elapsed(),
                e,
                waiters.len()
            ),
        }

        for (_, tx) in waiters {
            let _ = tx.send(result.clone());
        }
    }

    /// Transform and persist, both under the job deadline
    async fn execute(&self, fp: Fingerprint, work: JobWork, cancel: &CancellationToken) -> JobResult {
        match tokio::time::timeout(self.timeout, self.transform_and_persist(fp, work, cancel)).await {
            Ok(result) => result,
            Err(_) => {
                // The blocking thread cannot be interrupted; it sees the flag
                // at its next checkpoint and its result is discarded. A write
                // cut short here leaves at most an untracked blob for the
                // startup sweep.
                cancel.cancel();
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!("Job {} exceeded {} ms, slot reclaimed", fp.short(), timeout_ms);
                Err(ForgeError::Timeout { timeout_ms })
            }
        }
    }

    async fn transform_and_persist(
        &self,
        fp: Fingerprint,
        work: JobWork,
        cancel: &CancellationToken,
    ) -> JobResult {
        let transform = Arc::clone(&self.transform);
        let token = cancel.clone();
        let output =
            tokio::task::spawn_blocking(move || transform.apply(&work.input, &work.params, &token))
                .await
                .map_err(|join| ForgeError::Transform {
                    transform: self.transform.name().to_string(),
                    reason: format!("worker panicked: {}", join),
                })??;
        self.persist(fp, output).await
    }

    /// Write the output through the cache, or straight to storage when the
    /// cache is off or the output is larger than its budget
    async fn persist(&self, fp: Fingerprint, output: TransformOutput) -> JobResult {
        let meta = OutputMeta {
            format: output.format,
            width: output.width,
            height: output.height,
        };

        if let Some(cache) = &self.cache {
            match cache.put(fp, output.bytes.clone(), meta).await {
                Ok(entry) => return Ok(JobOutput::from_entry(&entry, false)),
                Err(ForgeError::CacheRejected { size, budget }) => {
                    debug!(
                        "Output of {} bytes exceeds cache budget of {}, storing uncached",
                        size, budget
                    );
                }
                Err(e) => {
                    // Eviction failures surface after the new entry is indexed
                    if let Some(entry) = cache.lookup(&fp) {
                        warn!("Cache eviction failed after storing {}: {}", fp.short(), e);
                        return Ok(JobOutput::from_entry(&entry, false));
                    }
                    return Err(e);
                }
            }
        }

        let storage_key = fp.storage_key(meta.format.extension());
        let size_bytes = output.bytes.len() as u64;
        self.storage.put(&storage_key, output.bytes).await?;
        Ok(JobOutput {
            fingerprint: fp,
            storage_key,
            size_bytes,
            format: meta.format,
            content_type: meta.format.mime(),
            width: meta.width,
            height: meta.height,
            cache_hit: false,
            cached: false,
        })
    }
}
