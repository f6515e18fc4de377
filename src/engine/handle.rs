//! Per-caller job handle

use super::job::{JobResult, WaiterId};
use super::EngineCore;
use crate::error::ForgeError;
use std::sync::Weak;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A caller's claim on a job's result
///
/// Several handles may share one underlying job when their requests have the
/// same fingerprint. Cancelling or dropping a handle detaches only that
/// caller; the job itself is cancelled once nobody is left waiting and it
/// has not started.
#[must_use = "dropping a JobHandle cancels the request"]
pub struct JobHandle {
    request_id: Uuid,
    waiter: WaiterId,
    rx: Option<oneshot::Receiver<JobResult>>,
    engine: Weak<EngineCore>,
}

impl JobHandle {
    pub(crate) fn new(
        request_id: Uuid,
        waiter: WaiterId,
        rx: oneshot::Receiver<JobResult>,
        engine: Weak<EngineCore>,
    ) -> Self {
        Self {
            request_id,
            waiter,
            rx: Some(rx),
            engine,
        }
    }

    /// Id of the request this handle was returned for
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait for the job to finish
    ///
    /// Dropping the returned future before it completes cancels this waiter.
    pub async fn wait(mut self) -> JobResult {
        let Some(rx) = self.rx.as_mut() else {
            return Err(ForgeError::Cancelled);
        };
        let result = rx.await.unwrap_or(Err(ForgeError::Cancelled));
        self.rx = None;
        result
    }

    /// Detach this waiter
    pub fn cancel(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.rx.take().is_none() {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.cancel_waiter(self.waiter);
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("request_id", &self.request_id)
            .field("waiter", &self.waiter)
            .finish()
    }
}
