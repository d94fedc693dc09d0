//! Background job handles
//!
//! Export and import jobs run on tokio's blocking pool. The caller gets a
//! [`Job`] handle that can be awaited or cancelled. Cancellation is
//! cooperative: the job checks its [`CancellationToken`] between entities
//! and stops with [`ArchiveError::Cancelled`].

use folio_core::{ArchiveError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Unique identifier of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    /// Fresh random id
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    /// Underlying uuid
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArchiveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Handle to a running job
pub struct Job<T> {
    id: JobId,
    token: CancellationToken,
    handle: JoinHandle<Result<T>>,
}

impl<T> Job<T> {
    pub(crate) fn new(id: JobId, token: CancellationToken, handle: JoinHandle<Result<T>>) -> Self {
        Self { id, token, handle }
    }

    /// Job identifier
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Ask the job to stop at the next entity boundary
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A token that cancels this job
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the job has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the job's result
    pub async fn wait(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ArchiveError::Cancelled),
            Err(e) => Err(ArchiveError::internal(format!("job {} panicked: {}", self.id, e))),
        }
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
