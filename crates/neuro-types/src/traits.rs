//! Persistence and storage interfaces, plus the errors that cross crate boundaries.

use crate::{InvalidTransition, Job, JobId, JobStatus, JobStep, Metric, StatusChange};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Job persistence. The single source of truth for job state.
///
/// Every status write goes through [`JobStore::compare_and_swap_status`]: the
/// write only lands when the stored status still equals `expected`, so a stale
/// worker can never overwrite a terminal state written by someone else.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job record.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Load one job by id.
    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically apply `change` if the current status equals `expected`.
    ///
    /// Returns `Ok(false)` when the status moved on (no write), and
    /// `Err(StoreError::InvalidTransition)` when `expected -> change.next` is not an
    /// edge of the state machine. Successful writes append a transition step.
    async fn compare_and_swap_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        change: StatusChange,
    ) -> Result<bool, StoreError>;

    /// Raise progress of a RUNNING job. Returns false when the job is not running or
    /// the value would go backwards. Successful writes append a progress step.
    async fn update_progress(&self, id: &JobId, percent: u8, step: &str)
        -> Result<bool, StoreError>;

    /// Append an entry to the job's step trail.
    async fn record_step(&self, id: &JobId, step: JobStep) -> Result<(), StoreError>;

    /// Step trail in insertion order.
    async fn steps(&self, id: &JobId) -> Result<Vec<JobStep>, StoreError>;

    /// Delete every metric row of the job and insert `metrics`, as one batch.
    async fn replace_metrics(&self, id: &JobId, metrics: &[Metric]) -> Result<(), StoreError>;

    /// Metric rows of a job.
    async fn metrics(&self, id: &JobId) -> Result<Vec<Metric>, StoreError>;

    /// All jobs, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError>;
}

/// Input/output artifact storage (local disk or an object store behind a local cache).
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Local filesystem path of the job's uploaded input, fetched first if needed.
    async fn resolve_input_path(&self, job: &Job) -> Result<PathBuf, StorageError>;

    /// Publish the job's output directory; returns the value stored as `result_path`.
    async fn persist_output(&self, job: &Job, output_dir: &Path) -> Result<String, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job store error: {0}")]
    Other(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Input not (yet) visible; typically a read racing the upload.
    #[error("input not found: {0}")]
    NotFound(String),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the same read may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            StorageError::Other(_) => false,
        }
    }
}

/// How a run ended when it did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    /// The job was already terminal when the run began or was superseded mid-run.
    Skipped,
}

/// Errors a job run reports back to its execution backend.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Retryable; the job has not been marked FAILED.
    #[error("transient: {0}")]
    Transient(String),
    /// The job is already persisted as FAILED.
    #[error("failed: {0}")]
    Failed(String),
    /// The store itself is unavailable; left to backend crash recovery.
    #[error("persistence: {0}")]
    Persistence(#[from] StoreError),
}

impl RunError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunError::Transient(_))
    }
}
