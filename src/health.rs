//! Liveness and readiness probes

use crate::engine::{EngineStats, JobEngine, RunningJob};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long a storage probe may take before the backend counts as not ready
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack past the job timeout before a held worker slot counts as stuck
pub const LIVENESS_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Failed { reason: String },
}

impl CheckStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: &'static str,
    #[serde(flatten)]
    pub status: CheckStatus,
    pub elapsed_ms: u64,
}

/// Combined health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// The engine answers and still accepts work
    pub live: bool,
    /// Live, and storage is reachable
    pub ready: bool,
    pub checks: Vec<Check>,
    pub engine: EngineStats,
}

/// Liveness only: the engine is open and no worker slot has been held
/// past the job timeout plus [`LIVENESS_GRACE`]
pub fn liveness(engine: &JobEngine) -> Check {
    let started = Instant::now();
    let status = if engine.stats().closed {
        CheckStatus::Failed {
            reason: "engine is shut down".to_string(),
        }
    } else {
        worker_status(&engine.running_jobs(), engine.job_timeout() + LIVENESS_GRACE)
    };
    Check {
        name: "engine",
        status,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn worker_status(running: &[RunningJob], limit: Duration) -> CheckStatus {
    let limit_ms = limit.as_millis() as u64;
    match running.iter().max_by_key(|job| job.running_ms) {
        Some(job) if job.running_ms > limit_ms => {
            warn!(
                "Job {} has held worker slot {} for {} ms",
                job.job_id, job.slot, job.running_ms
            );
            CheckStatus::Failed {
                reason: format!(
                    "worker slot {} stuck on job {} for {} ms (limit {} ms)",
                    job.slot, job.job_id, job.running_ms, limit_ms
                ),
            }
        }
        _ => CheckStatus::Ok,
    }
}

/// Readiness of the storage backend, bounded by `timeout`
pub async fn storage_readiness(engine: &JobEngine, timeout: Duration) -> Check {
    let started = Instant::now();
    let status = match tokio::time::timeout(timeout, engine.storage().health_check()).await {
        Ok(Ok(())) => CheckStatus::Ok,
        Ok(Err(e)) => {
            warn!(
                "Storage health check failed ({}): {}",
                engine.storage().backend_name(),
                e
            );
            CheckStatus::Failed {
                reason: e.to_string(),
            }
        }
        Err(_) => {
            warn!("Storage health check timed out after {:?}", timeout);
            CheckStatus::Failed {
                reason: format!("no response within {} ms", timeout.as_millis()),
            }
        }
    };
    Check {
        name: "storage",
        status,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Run every probe
pub async fn report(engine: &JobEngine) -> HealthReport {
    report_with_timeout(engine, READINESS_TIMEOUT).await
}

pub async fn report_with_timeout(engine: &JobEngine, timeout: Duration) -> HealthReport {
    let engine_check = liveness(engine);
    let storage_check = storage_readiness(engine, timeout).await;
    let live = engine_check.status.is_ok();
    let ready = live && storage_check.status.is_ok();
    debug!("Health: live={} ready={}", live, ready);

    HealthReport {
        live,
        ready,
        checks: vec![engine_check, storage_check],
        engine: engine.stats(),
    }
}
