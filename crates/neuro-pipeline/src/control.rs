//! Entry points for the layer that accepts uploads: create, submit, cancel.

use neuro_scheduler::{BackendError, ExecutionBackend, ProcessLifecycleManager, TaskHandle};
use neuro_types::{Job, JobId, JobStatus, JobStore, StatusChange, StoreError};
use std::sync::Arc;

/// CAS attempts when the status moves under a cancel (PENDING -> RUNNING).
const CANCEL_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is {1}, expected pending")]
    NotPending(JobId, JobStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    /// Status the job had when the cancel landed.
    pub previous: JobStatus,
    /// Whether the job's status was changed by this request.
    pub cancelled: bool,
    /// Whether the backend accepted a cancellation signal.
    pub signal_delivered: bool,
}

pub struct JobControl {
    store: Arc<dyn JobStore>,
    backend: Arc<dyn ExecutionBackend>,
    lifecycle: Arc<ProcessLifecycleManager>,
}

impl JobControl {
    pub fn new(
        store: Arc<dyn JobStore>,
        backend: Arc<dyn ExecutionBackend>,
        lifecycle: Arc<ProcessLifecycleManager>,
    ) -> Self {
        Self {
            store,
            backend,
            lifecycle,
        }
    }

    /// Record a PENDING job for an uploaded file.
    pub async fn create(&self, filename: &str, file_path: Option<String>) -> Result<Job, ControlError> {
        let job = Job::new(filename, file_path);
        self.store.create(&job).await?;
        tracing::info!(job_id = %job.id, filename, "job created");
        Ok(job)
    }

    /// Hand a PENDING job to the execution backend.
    pub async fn submit(&self, job_id: &JobId) -> Result<TaskHandle, ControlError> {
        let job = self
            .store
            .load(job_id)
            .await?
            .ok_or(ControlError::NotFound(*job_id))?;
        if job.status != JobStatus::Pending {
            return Err(ControlError::NotPending(*job_id, job.status));
        }
        Ok(self.backend.submit(job_id).await?)
    }

    pub async fn create_and_submit(
        &self,
        filename: &str,
        file_path: Option<String>,
    ) -> Result<(Job, TaskHandle), ControlError> {
        let job = self.create(filename, file_path).await?;
        let handle = self.submit(&job.id).await?;
        Ok((job, handle))
    }

    /// Mark the job CANCELLED, then revoke its task and stop its processes.
    ///
    /// The status write comes first and is authoritative: a run still in flight
    /// sees it at its next checkpoint even if the process outlives the signal.
    pub async fn cancel(&self, job_id: &JobId) -> Result<Cancellation, ControlError> {
        for _ in 0..CANCEL_RETRIES {
            let job = self
                .store
                .load(job_id)
                .await?
                .ok_or(ControlError::NotFound(*job_id))?;
            if job.status.is_terminal() {
                tracing::info!(job_id = %job_id, status = %job.status, "cancel ignored, job already terminal");
                return Ok(Cancellation {
                    previous: job.status,
                    cancelled: false,
                    signal_delivered: false,
                });
            }
            if !self
                .store
                .compare_and_swap_status(job_id, job.status, StatusChange::cancel())
                .await?
            {
                continue;
            }
            let signal_delivered = self.lifecycle.cancel(job_id, job.status).await;
            return Ok(Cancellation {
                previous: job.status,
                cancelled: true,
                signal_delivered,
            });
        }
        Err(StoreError::Other(format!("job {} kept changing status during cancel", job_id)).into())
    }
}
