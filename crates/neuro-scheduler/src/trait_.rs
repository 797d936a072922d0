//! Execution backend and job runner contracts.

use async_trait::async_trait;
use neuro_types::{BackendKind, JobId, RunError, RunOutcome};
use std::fmt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("job {0} already has an active task")]
    AlreadySubmitted(JobId),
    #[error("malformed task handle: {0}")]
    BadHandle(String),
    #[error("backend is shut down")]
    Closed,
    #[error("backend error: {0}")]
    Other(String),
}

/// Backend-specific reference to the unit of work running a job. Only used to
/// find and cancel work, never to carry data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub backend: BackendKind,
    pub job_id: JobId,
    pub task_id: String,
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend.as_str(), self.task_id)
    }
}

/// Submit / cancel / find, identical across backends.
///
/// A job has at most one active handle: `submit` fails with
/// [`BackendError::AlreadySubmitted`] while a previous one is queued or running.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Enqueue the job.
    async fn submit(&self, job_id: &JobId) -> Result<TaskHandle, BackendError>;

    /// With `force = false`, stop queued work from starting; with `force = true`,
    /// also interrupt work in progress. Returns whether a signal was delivered,
    /// not whether the work has stopped.
    async fn cancel(&self, handle: &TaskHandle, force: bool) -> Result<bool, BackendError>;

    /// Handle of queued or running work for the job.
    async fn find(&self, job_id: &JobId) -> Result<Option<TaskHandle>, BackendError>;
}

/// Per-delivery context handed to the runner.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// 1-based delivery count.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Fired when the backend is asked to interrupt the work.
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn single() -> Self {
        Self {
            attempt: 1,
            max_attempts: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// No retry follows a transient failure of this delivery.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Why a backend gave up on a delivery whose worker vanished mid-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abandonment {
    /// Cancellation had been requested for the task.
    Revoked,
    /// No attempts left; carries the reason recorded on the task.
    Failed(String),
}

/// Runs one job to a terminal state. Implemented by the orchestrator.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job_id: &JobId, ctx: &RunContext) -> Result<RunOutcome, RunError>;

    /// Settle a job whose last delivery died with its worker, so it does not
    /// stay RUNNING. Called at most once per abandoned delivery.
    async fn abandon(&self, _job_id: &JobId, _how: &Abandonment) -> Result<(), RunError> {
        Ok(())
    }
}
