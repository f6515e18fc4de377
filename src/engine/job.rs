//! Job request, state machine and result types

use crate::cache::{format_bytes, CacheEntry};
use crate::error::ForgeError;
use crate::fingerprint::Fingerprint;
use crate::ingest::{InputSource, RawImage};
use crate::transform::{NormalizedParams, OutputFormat, TransformParams};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A request to transform one image
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: Uuid,
    pub source: InputSource,
    pub params: TransformParams,
    pub submitted_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(source: InputSource, params: TransformParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            params,
            submitted_at: Utc::now(),
        }
    }

    pub fn upload(bytes: Bytes, declared_mime: Option<String>, params: TransformParams) -> Self {
        Self::new(
            InputSource::Upload {
                bytes,
                declared_mime,
            },
            params,
        )
    }

    pub fn url(url: impl Into<String>, params: TransformParams) -> Self {
        Self::new(InputSource::Url(url.into()), params)
    }
}

/// Lifecycle of a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions: Pending to Running or Cancelled, Running to a result
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Where a finished job's output lives
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutput {
    pub fingerprint: Fingerprint,
    pub storage_key: String,
    pub size_bytes: u64,
    pub format: OutputFormat,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
    /// Served from the cache without running a transform
    pub cache_hit: bool,
    /// Recorded in the cache for later hits
    pub cached: bool,
}

impl JobOutput {
    pub(crate) fn from_entry(entry: &CacheEntry, cache_hit: bool) -> Self {
        Self {
            fingerprint: entry.fingerprint,
            storage_key: entry.storage_key.clone(),
            size_bytes: entry.size_bytes,
            format: entry.meta.format,
            content_type: entry.meta.format.mime(),
            width: entry.meta.width,
            height: entry.meta.height,
            cache_hit,
            cached: true,
        }
    }

    pub fn size_display(&self) -> String {
        format_bytes(self.size_bytes)
    }
}

/// A job currently holding a worker slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningJob {
    /// Id of the request that created the job
    pub job_id: Uuid,
    pub fingerprint: Fingerprint,
    pub slot: usize,
    pub running_ms: u64,
}

/// Outcome delivered to every waiter of a job
pub type JobResult = Result<JobOutput, ForgeError>;

pub(crate) type WaiterId = u64;

/// Input and parameters handed to the worker at dispatch
pub(crate) struct JobWork {
    pub input: RawImage,
    pub params: NormalizedParams,
}

/// In-flight bookkeeping for one fingerprint
pub(crate) struct JobRecord {
    pub job_id: Uuid,
    pub state: JobState,
    pub slot: Option<usize>,
    pub waiters: HashMap<WaiterId, oneshot::Sender<JobResult>>,
    pub work: Option<JobWork>,
    pub cancel: CancellationToken,
    pub admitted_at: Instant,
    pub started_at: Option<Instant>,
}

impl JobRecord {
    pub fn new(job_id: Uuid, work: JobWork) -> Self {
        Self {
            job_id,
            state: JobState::Pending,
            slot: None,
            waiters: HashMap::new(),
            work: Some(work),
            cancel: CancellationToken::new(),
            admitted_at: Instant::now(),
            started_at: None,
        }
    }

    /// Move to Running on a worker slot
    pub fn start(&mut self, slot: usize) -> bool {
        if !self.transition(JobState::Running) {
            return false;
        }
        self.slot = Some(slot);
        self.started_at = Some(Instant::now());
        true
    }

    /// Slot view of a Running record
    pub fn running(&self, fingerprint: Fingerprint, now: Instant) -> Option<RunningJob> {
        let (slot, started_at) = self.slot.zip(self.started_at)?;
        (self.state == JobState::Running).then(|| RunningJob {
            job_id: self.job_id,
            fingerprint,
            slot,
            running_ms: now.saturating_duration_since(started_at).as_millis() as u64,
        })
    }

    /// Apply a transition, refusing illegal ones
    pub fn transition(&mut self, next: JobState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}
