//! Drives one job from RUNNING to a terminal state.
//!
//! Every status write is a compare-and-swap from RUNNING, and the persisted
//! status is re-read at each step boundary, so a run that lost a race with a
//! cancel (or with another delivery of the same job) never overwrites the
//! terminal state someone else wrote.

use crate::progress::{ProgressReporter, ProgressWriter};
use crate::results::write_results_file;
use async_trait::async_trait;
use neuro_metrics::{ExtractError, MetricExtractor};
use neuro_scheduler::{Abandonment, JobRunner, RunContext};
use neuro_segment::{InvokeError, Invocation, OutputSource, SegmentationInvoker};
use neuro_types::{
    ArtifactStorage, Job, JobId, JobStatus, JobStep, JobStore, Metric, RunError, RunOutcome,
    StatusChange, StepKind, StoreError, DEFAULT_LATERALITY_THRESHOLD,
};
use std::path::Path;
use std::sync::Arc;

/// Why a run stopped before COMPLETED.
#[derive(Debug)]
enum Halt {
    /// Cancelled by the user, or interrupted by the backend.
    Cancelled,
    /// Another actor moved the job to this status.
    Superseded(JobStatus),
    Failed { message: String, transient: bool },
    Store(StoreError),
}

impl From<StoreError> for Halt {
    fn from(e: StoreError) -> Self {
        Halt::Store(e)
    }
}

impl Halt {
    fn failed(message: impl Into<String>) -> Self {
        Halt::Failed {
            message: message.into(),
            transient: false,
        }
    }

    fn transient(message: impl Into<String>) -> Self {
        Halt::Failed {
            message: message.into(),
            transient: true,
        }
    }
}

/// Why metrics could not be recomputed for a job.
#[derive(Debug, thiserror::Error)]
pub enum RegenerateError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is {1}, expected completed")]
    NotCompleted(JobId, JobStatus),
    #[error("job {0} has no segmentation output on disk")]
    NoOutput(JobId),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Output of steps 1-5, ready to be published.
struct Prepared {
    invocation: Invocation,
    metrics: Vec<Metric>,
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    storage: Arc<dyn ArtifactStorage>,
    invoker: Arc<SegmentationInvoker>,
    extractor: MetricExtractor,
    laterality_threshold: f64,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        storage: Arc<dyn ArtifactStorage>,
        invoker: Arc<SegmentationInvoker>,
    ) -> Self {
        Self {
            store,
            storage,
            invoker,
            extractor: MetricExtractor::new(),
            laterality_threshold: DEFAULT_LATERALITY_THRESHOLD,
        }
    }

    pub fn with_extractor(mut self, extractor: MetricExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_laterality_threshold(mut self, threshold: f64) -> Self {
        self.laterality_threshold = threshold;
        self
    }

    /// Recompute a completed job's metrics from the output already on disk,
    /// replacing the stored rows and `metrics.json`. Nothing is re-segmented.
    pub async fn regenerate(&self, job_id: &JobId) -> Result<Vec<Metric>, RegenerateError> {
        let job = self
            .store
            .load(job_id)
            .await?
            .ok_or(RegenerateError::NotFound(*job_id))?;
        if job.status != JobStatus::Completed {
            return Err(RegenerateError::NotCompleted(*job_id, job.status));
        }
        let invocation = self
            .invoker
            .existing_output(job_id)
            .await
            .ok_or(RegenerateError::NoOutput(*job_id))?;
        let pairs = self.extractor.extract(&invocation.output_dir, job_id).await?;
        let metrics: Vec<Metric> = pairs.iter().map(|p| Metric::from_pair(*job_id, p)).collect();
        self.store.replace_metrics(job_id, &metrics).await?;
        if let Err(e) = write_results_file(&invocation, job_id, &metrics, self.laterality_threshold).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to write metrics.json");
        }
        self.store
            .record_step(
                job_id,
                JobStep::new(StepKind::Note, 100, format!("Metrics regenerated ({} regions)", metrics.len())),
            )
            .await?;
        tracing::info!(
            job_id = %job_id,
            regions = metrics.len(),
            placeholder = invocation.source.is_placeholder(),
            "metrics regenerated"
        );
        Ok(metrics)
    }

    /// Move PENDING to RUNNING, or pick up a redelivered RUNNING job as is.
    /// `Ok(None)` means there is nothing to run.
    async fn start(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let Some(job) = self.store.load(job_id).await? else {
            tracing::warn!(job_id = %job_id, "job not found, skipping");
            return Ok(None);
        };
        match job.status {
            JobStatus::Pending => {
                if !self
                    .store
                    .compare_and_swap_status(job_id, JobStatus::Pending, StatusChange::start())
                    .await?
                {
                    tracing::info!(job_id = %job_id, "job left PENDING before it could start");
                    return Ok(None);
                }
                Ok(self.store.load(job_id).await?)
            }
            JobStatus::Running => {
                tracing::info!(job_id = %job_id, progress = job.progress, "resuming redelivered job");
                Ok(Some(job))
            }
            status => {
                tracing::info!(job_id = %job_id, %status, "job already terminal, skipping");
                Ok(None)
            }
        }
    }

    /// Cancellation check between steps.
    async fn checkpoint(&self, job_id: &JobId, ctx: &RunContext) -> Result<(), Halt> {
        if ctx.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        match self.store.load(job_id).await?.map(|j| j.status) {
            Some(JobStatus::Running) => Ok(()),
            Some(JobStatus::Cancelled) | None => Err(Halt::Cancelled),
            Some(other) => Err(Halt::Superseded(other)),
        }
    }

    /// Steps 1-5: resolve input, segment, extract, compute, persist metrics.
    async fn drive(
        &self,
        job: &Job,
        ctx: &RunContext,
        reporter: &ProgressReporter,
        metrics_written: &mut bool,
    ) -> Result<Prepared, Halt> {
        let job_id = &job.id;
        reporter.milestone(5, "Starting processing");
        self.checkpoint(job_id, ctx).await?;

        let input = match self.storage.resolve_input_path(job).await {
            Ok(path) => path,
            Err(e) if e.is_transient() => return Err(Halt::transient(e.to_string())),
            Err(e) => return Err(Halt::failed(e.to_string())),
        };
        reporter.milestone(10, "Input resolved");
        self.checkpoint(job_id, ctx).await?;

        reporter.milestone(15, "Starting brain segmentation");
        let invocation = self.segment(&input, job_id, ctx, reporter).await?;
        if let OutputSource::Placeholder { reason } = &invocation.source {
            let step = JobStep::new(
                StepKind::Placeholder,
                60,
                format!("Mock data used: placeholder segmentation output ({})", reason),
            );
            self.store.record_step(job_id, step).await?;
        }
        self.checkpoint(job_id, ctx).await?;

        reporter.milestone(65, "Extracting hippocampal volumes");
        let pairs = self
            .extractor
            .extract(&invocation.output_dir, job_id)
            .await
            .map_err(|e| Halt::failed(e.to_string()))?;
        self.checkpoint(job_id, ctx).await?;

        reporter.milestone(70, "Calculating asymmetry indices");
        let metrics: Vec<Metric> = pairs.iter().map(|p| Metric::from_pair(*job_id, p)).collect();
        for m in &metrics {
            tracing::info!(
                job_id = %job_id,
                region = %m.region,
                left = m.left_volume,
                right = m.right_volume,
                asymmetry_index = m.asymmetry_index,
                laterality = m.laterality(self.laterality_threshold).label(),
                "asymmetry computed"
            );
        }
        self.checkpoint(job_id, ctx).await?;

        reporter.milestone(85, "Saving results");
        self.store.replace_metrics(job_id, &metrics).await?;
        *metrics_written = true;
        if let Err(e) = write_results_file(&invocation, job_id, &metrics, self.laterality_threshold).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to write metrics.json");
        }
        reporter.milestone(95, "Finalizing");

        Ok(Prepared { invocation, metrics })
    }

    async fn segment(
        &self,
        input: &Path,
        job_id: &JobId,
        ctx: &RunContext,
        reporter: &ProgressReporter,
    ) -> Result<Invocation, Halt> {
        let progress = {
            let reporter = reporter.clone();
            move |percent: u8, step: &str| reporter.report(percent, step)
        };
        match self.invoker.invoke(input, job_id, &progress, &ctx.cancel).await {
            Ok(invocation) => Ok(invocation),
            Err(InvokeError::Cancelled) => Err(Halt::Cancelled),
            // The input vanished between resolution and launch: same race as a missing upload.
            Err(e @ InvokeError::InputMissing(_)) => Err(Halt::transient(e.to_string())),
            Err(e) => Err(Halt::failed(e.to_string())),
        }
    }

    async fn finish_cancelled(&self, job_id: &JobId, metrics_written: bool) -> Result<RunOutcome, RunError> {
        if metrics_written {
            self.store.replace_metrics(job_id, &[]).await?;
        }
        match self
            .store
            .compare_and_swap_status(job_id, JobStatus::Running, StatusChange::cancel())
            .await
        {
            Ok(true) => tracing::info!(job_id = %job_id, "job cancelled"),
            Ok(false) => tracing::info!(job_id = %job_id, "job cancellation already recorded"),
            Err(StoreError::NotFound(_)) => tracing::info!(job_id = %job_id, "job removed while running"),
            Err(e) => return Err(e.into()),
        }
        Ok(RunOutcome::Cancelled)
    }

    async fn finish_failed(
        &self,
        job_id: &JobId,
        ctx: &RunContext,
        message: String,
        transient: bool,
    ) -> Result<RunOutcome, RunError> {
        if transient && !ctx.is_last_attempt() {
            tracing::warn!(job_id = %job_id, attempt = ctx.attempt, error = %message, "transient failure, leaving job for retry");
            self.store
                .record_step(
                    job_id,
                    JobStep::new(StepKind::Note, 0, format!("Attempt {} failed, retrying: {}", ctx.attempt, message)),
                )
                .await?;
            return Err(RunError::Transient(message));
        }
        tracing::error!(job_id = %job_id, error = %message, "job failed");
        if self
            .store
            .compare_and_swap_status(job_id, JobStatus::Running, StatusChange::fail(message.clone()))
            .await?
        {
            return Err(RunError::Failed(message));
        }
        Ok(self.settled(job_id).await?)
    }

    /// Outcome when a terminal write lost to another actor.
    async fn settled(&self, job_id: &JobId) -> Result<RunOutcome, StoreError> {
        Ok(match self.store.load(job_id).await?.map(|j| j.status) {
            Some(JobStatus::Cancelled) | None => RunOutcome::Cancelled,
            _ => RunOutcome::Skipped,
        })
    }

    async fn complete(&self, job: &Job, prepared: Prepared) -> Result<RunOutcome, RunError> {
        let job_id = &job.id;
        let result_path = match self
            .storage
            .persist_output(job, &prepared.invocation.output_dir)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "failed to publish output, keeping local path");
                prepared.invocation.output_dir.display().to_string()
            }
        };
        if self
            .store
            .compare_and_swap_status(job_id, JobStatus::Running, StatusChange::complete(result_path))
            .await?
        {
            tracing::info!(
                job_id = %job_id,
                regions = prepared.metrics.len(),
                placeholder = prepared.invocation.source.is_placeholder(),
                "job completed"
            );
            return Ok(RunOutcome::Completed);
        }
        let outcome = self.settled(job_id).await?;
        if outcome == RunOutcome::Cancelled {
            self.store.replace_metrics(job_id, &[]).await?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl JobRunner for Orchestrator {
    async fn run(&self, job_id: &JobId, ctx: &RunContext) -> Result<RunOutcome, RunError> {
        let Some(job) = self.start(job_id).await? else {
            return Ok(RunOutcome::Skipped);
        };
        tracing::info!(job_id = %job_id, filename = %job.filename, attempt = ctx.attempt, "processing job");

        let (reporter, writer): (ProgressReporter, ProgressWriter) =
            ProgressReporter::spawn(Arc::clone(&self.store), *job_id, job.progress);
        let mut metrics_written = false;
        let driven = self.drive(&job, ctx, &reporter, &mut metrics_written).await;
        writer.finish(reporter).await;

        let halt = match driven {
            Ok(prepared) => match self.checkpoint(job_id, ctx).await {
                Ok(()) => return self.complete(&job, prepared).await,
                Err(halt) => halt,
            },
            Err(halt) => halt,
        };
        match halt {
            Halt::Cancelled => self.finish_cancelled(job_id, metrics_written).await,
            Halt::Superseded(status) => {
                tracing::info!(job_id = %job_id, %status, "job changed by another actor, stopping");
                // A COMPLETED job owns the metrics another delivery wrote.
                if metrics_written && status != JobStatus::Completed {
                    self.store.replace_metrics(job_id, &[]).await?;
                }
                Ok(RunOutcome::Skipped)
            }
            Halt::Failed { message, transient } => {
                self.finish_failed(job_id, ctx, message, transient).await
            }
            Halt::Store(e) => Err(RunError::Persistence(e)),
        }
    }

    async fn abandon(&self, job_id: &JobId, how: &Abandonment) -> Result<(), RunError> {
        let change = match how {
            Abandonment::Revoked => StatusChange::cancel(),
            Abandonment::Failed(reason) => StatusChange::fail(reason.clone()),
        };
        match self
            .store
            .compare_and_swap_status(job_id, JobStatus::Running, change)
            .await
        {
            Ok(true) => {
                self.store.replace_metrics(job_id, &[]).await?;
                tracing::warn!(job_id = %job_id, ?how, "abandoned job settled");
            }
            Ok(false) => tracing::info!(job_id = %job_id, "abandoned job already left RUNNING"),
            Err(StoreError::NotFound(_)) => tracing::info!(job_id = %job_id, "abandoned job no longer exists"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
