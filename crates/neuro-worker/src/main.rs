//! Segmentation worker: runs queued jobs, and submits, cancels and inspects them.
//!
//! Configuration comes from the environment (see `Settings::from_env`).

use clap::{Parser, Subcommand};
use neuro_metrics::MetricExtractor;
use neuro_pipeline::{JobControl, Orchestrator};
use neuro_process::ProcessRegistry;
use neuro_scheduler::{
    spawn_workers, DirectBackend, ExecutionBackend, JobRunner, ProcessLifecycleManager, QueueBackend,
    QueueWorker,
};
use neuro_segment::{HostPaths, SegmentationInvoker};
use neuro_store::{LocalArtifactStorage, SqliteJobStore};
use neuro_types::{BackendKind, JobId, JobStatus, JobStore, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "neuro-worker")]
#[command(about = "Hippocampal segmentation job worker", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process jobs until interrupted
    Run {
        /// Number of concurrent jobs (overrides MAX_CONCURRENT_JOBS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Create a job for an image and hand it to the backend
    Submit {
        /// Input image (.nii, .nii.gz or .mgz)
        file: PathBuf,
    },
    /// Cancel a pending or running job
    Cancel { job_id: JobId },
    /// Kill segmentation processes whose job is no longer running
    Reap {
        /// Only report what would be killed
        #[arg(long)]
        dry_run: bool,
    },
    /// Show a job, its steps and metrics
    Status { job_id: JobId },
    /// Recompute a completed job's metrics from its output on disk
    Regenerate { job_id: JobId },
}

/// Everything the subcommands share.
struct Components {
    settings: Settings,
    store: Arc<SqliteJobStore>,
    registry: ProcessRegistry,
}

impl Components {
    async fn open(settings: Settings) -> Result<Self, BoxError> {
        for dir in [&settings.storage.upload_dir, &settings.storage.output_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        ensure_parent(&settings.database.job_db_path).await?;
        ensure_parent(&settings.database.queue_db_path).await?;
        let store = Arc::new(SqliteJobStore::new(&settings.database.job_db_path)?);
        let registry = ProcessRegistry::new(&settings.storage.output_dir);
        Ok(Self {
            settings,
            store,
            registry,
        })
    }

    async fn orchestrator(&self) -> Arc<Orchestrator> {
        let host_paths = HostPaths::resolve(&self.settings.storage, &self.settings.invoker).await;
        let invoker = SegmentationInvoker::new(
            self.settings.invoker.clone(),
            &self.settings.storage.output_dir,
            host_paths,
            self.registry.clone(),
        );
        let storage = Arc::new(LocalArtifactStorage::from_settings(&self.settings.storage));
        let analysis = &self.settings.analysis;
        Arc::new(
            Orchestrator::new(self.store.clone(), storage, Arc::new(invoker))
                .with_extractor(MetricExtractor::new().with_subfields(analysis.include_subfields))
                .with_laterality_threshold(analysis.laterality_threshold),
        )
    }

    fn queue(&self) -> Result<QueueBackend, BoxError> {
        Ok(QueueBackend::new(
            &self.settings.database.queue_db_path,
            self.settings.backend.clone(),
        )?)
    }

    fn lifecycle(&self, backend: Arc<dyn ExecutionBackend>) -> Arc<ProcessLifecycleManager> {
        Arc::new(ProcessLifecycleManager::new(
            backend,
            self.registry.clone(),
            self.settings.lifecycle.clone(),
        ))
    }

    fn control(&self, backend: Arc<dyn ExecutionBackend>) -> JobControl {
        JobControl::new(self.store.clone(), backend.clone(), self.lifecycle(backend))
    }
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let components = Components::open(Settings::from_env()).await?;
    match args.command {
        Command::Run { workers } => run(components, workers).await,
        Command::Submit { file } => submit(components, &file).await,
        Command::Cancel { job_id } => cancel(components, &job_id).await,
        Command::Reap { dry_run } => reap(components, dry_run).await,
        Command::Status { job_id } => status(components, &job_id).await,
        Command::Regenerate { job_id } => regenerate(components, &job_id).await,
    }
}

async fn run(components: Components, workers: Option<usize>) -> Result<(), BoxError> {
    let workers = workers.unwrap_or(components.settings.backend.workers).max(1);
    let shutdown = CancellationToken::new();
    let runner: Arc<dyn JobRunner> = components.orchestrator().await;

    let mut handles = Vec::new();
    let backend: Arc<dyn ExecutionBackend> = match components.settings.backend.kind {
        BackendKind::Queue => {
            let queue = components.queue()?;
            handles = spawn_workers(&queue, runner, workers, &worker_prefix(), shutdown.clone());
            Arc::new(queue)
        }
        BackendKind::Direct => {
            let direct = Arc::new(DirectBackend::new(runner, workers));
            // In-process backend: nothing outlives this process, so pick up what is still pending.
            for job in components.store.list(Some(JobStatus::Pending)).await? {
                direct.submit(&job.id).await?;
            }
            direct
        }
    };
    tracing::info!(kind = backend.kind().as_str(), workers, "worker started");

    let lifecycle = components.lifecycle(backend.clone());
    let reaper = tokio::spawn(reap_periodically(
        lifecycle,
        components.store.clone(),
        components.settings.lifecycle.reap_interval,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "worker task ended abnormally");
        }
    }
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "reaper task ended abnormally");
    }
    Ok(())
}

fn worker_prefix() -> String {
    format!("worker-{}", std::process::id())
}

async fn reap_periodically(
    lifecycle: Arc<ProcessLifecycleManager>,
    store: Arc<SqliteJobStore>,
    every: Duration,
    shutdown: CancellationToken,
) {
    if every.is_zero() {
        return;
    }
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match lifecycle.reap_orphans(store.as_ref(), false).await {
            Ok(report) if !report.orphans.is_empty() => {
                tracing::warn!(orphans = report.orphans.len(), terminated = report.terminated.len(), "reaped orphaned processes");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "orphan reap failed"),
        }
    }
}

/// Copy the input under the upload directory unless it already lives there.
async fn stage_input(upload_dir: &Path, file: &Path) -> Result<(String, String), BoxError> {
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("not a file: {}", file.display()))?;
    let source = tokio::fs::canonicalize(file).await?;
    let upload_dir = tokio::fs::canonicalize(upload_dir).await?;
    if source.starts_with(&upload_dir) {
        let relative = source
            .strip_prefix(&upload_dir)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| source.display().to_string());
        return Ok((filename, relative));
    }
    let staged = format!("{}_{}", chrono::Utc::now().format("%Y%m%d%H%M%S%3f"), filename);
    tokio::fs::copy(&source, upload_dir.join(&staged)).await?;
    Ok((filename, staged))
}

async fn submit(components: Components, file: &Path) -> Result<(), BoxError> {
    let (filename, file_path) = stage_input(&components.settings.storage.upload_dir, file).await?;
    match components.settings.backend.kind {
        BackendKind::Queue => {
            let backend: Arc<dyn ExecutionBackend> = Arc::new(components.queue()?);
            let (job, handle) = components
                .control(backend)
                .create_and_submit(&filename, Some(file_path))
                .await?;
            println!("{} queued as {}", job.id, handle);
        }
        BackendKind::Direct => {
            // No separate worker can see an in-process backend: run the job here.
            let direct = Arc::new(DirectBackend::new(components.orchestrator().await, 1));
            let (job, _) = components
                .control(direct.clone())
                .create_and_submit(&filename, Some(file_path))
                .await?;
            println!("{} running in-process", job.id);
            let job = wait_terminal(components.store.as_ref(), &job.id).await?;
            direct.shutdown();
            println!("{} {}", job.id, job.status);
            if let Some(message) = job.error_message {
                println!("  {}", message);
            }
        }
    }
    Ok(())
}

async fn wait_terminal(store: &dyn JobStore, job_id: &JobId) -> Result<neuro_types::Job, BoxError> {
    loop {
        let job = store
            .load(job_id)
            .await?
            .ok_or_else(|| format!("job {} disappeared", job_id))?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn cancel(components: Components, job_id: &JobId) -> Result<(), BoxError> {
    let backend: Arc<dyn ExecutionBackend> = match components.settings.backend.kind {
        BackendKind::Queue => Arc::new(components.queue()?),
        // Nothing to revoke across processes; the status write and process kill still apply.
        BackendKind::Direct => Arc::new(DirectBackend::new(components.orchestrator().await, 1)),
    };
    let outcome = components.control(backend).cancel(job_id).await?;
    if outcome.cancelled {
        println!(
            "{} cancelled (was {}, signal {})",
            job_id,
            outcome.previous,
            if outcome.signal_delivered { "delivered" } else { "not delivered" }
        );
    } else {
        println!("{} already {}", job_id, outcome.previous);
    }
    Ok(())
}

async fn reap(components: Components, dry_run: bool) -> Result<(), BoxError> {
    let backend: Arc<dyn ExecutionBackend> = match components.settings.backend.kind {
        BackendKind::Queue => {
            let queue = components.queue()?;
            if !dry_run {
                settle_queue(&components, &queue).await?;
            }
            Arc::new(queue)
        }
        // Never started here: no queue database to open, nothing queued to settle.
        BackendKind::Direct => Arc::new(DirectBackend::new(components.orchestrator().await, 1)),
    };
    let report = components
        .lifecycle(backend)
        .reap_orphans(components.store.as_ref(), dry_run)
        .await?;
    if report.orphans.is_empty() {
        println!("no orphaned processes");
        return Ok(());
    }
    for (pid, job) in &report.orphans {
        let job = job
            .as_ref()
            .map(|j| j.to_string())
            .unwrap_or_else(|| "unknown job".into());
        println!("orphan pid {} ({})", pid, job);
    }
    if !dry_run {
        println!(
            "terminated {}, failed {}",
            report.terminated.len(),
            report.failed.len()
        );
    }
    Ok(())
}

/// Recover tasks whose worker died and settle the jobs they leave behind.
async fn settle_queue(components: &Components, queue: &QueueBackend) -> Result<(), BoxError> {
    let requeued = queue.requeue_stale()?;
    let worker = QueueWorker::new(queue.clone(), components.orchestrator().await, "reap");
    let settled = worker.settle_abandoned().await;
    if requeued > 0 || settled > 0 {
        println!("recovered {} stale task(s), settled {} abandoned job(s)", requeued, settled);
    }
    Ok(())
}

async fn regenerate(components: Components, job_id: &JobId) -> Result<(), BoxError> {
    let metrics = components.orchestrator().await.regenerate(job_id).await?;
    let threshold = components.settings.analysis.laterality_threshold;
    for m in &metrics {
        println!(
            "{:<24} left {:>10.1}  right {:>10.1}  AI {:>7.4}  {}",
            m.region,
            m.left_volume,
            m.right_volume,
            m.asymmetry_index,
            m.laterality(threshold).label()
        );
    }
    Ok(())
}

async fn status(components: Components, job_id: &JobId) -> Result<(), BoxError> {
    let job = components
        .store
        .load(job_id)
        .await?
        .ok_or_else(|| format!("job not found: {}", job_id))?;
    let steps = components.store.steps(job_id).await?;
    let metrics = components.store.metrics(job_id).await?;
    let task = match components.settings.backend.kind {
        BackendKind::Queue => components.queue()?.describe(job_id)?.map(|t| {
            serde_json::json!({
                "task_id": t.task_id,
                "state": t.state,
                "attempts": t.attempts,
                "worker": t.worker,
                "last_error": t.last_error,
            })
        }),
        BackendKind::Direct => None,
    };
    let body = serde_json::json!({
        "job": job,
        "steps": steps,
        "metrics": metrics,
        "task": task,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuro_types::{Job, StatusChange};

    fn settings(dir: &Path, kind: BackendKind) -> Settings {
        let mut settings = Settings::default();
        settings.storage.upload_dir = dir.join("uploads");
        settings.storage.output_dir = dir.join("outputs");
        settings.database.job_db_path = dir.join("jobs.db");
        settings.database.queue_db_path = dir.join("queue.db");
        settings.invoker.host_upload_dir = Some(dir.join("uploads"));
        settings.invoker.host_output_dir = Some(dir.join("outputs"));
        settings.backend.kind = kind;
        settings
    }

    #[tokio::test]
    async fn reap_with_direct_backend_leaves_queue_database_alone() {
        let dir = tempfile::tempdir().unwrap();
        let components = Components::open(settings(dir.path(), BackendKind::Direct)).await.unwrap();
        reap(components, true).await.unwrap();
        assert!(!dir.path().join("queue.db").exists());
    }

    #[tokio::test]
    async fn reap_settles_job_whose_worker_died() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), BackendKind::Queue);
        settings.backend.max_attempts = 1;
        settings.backend.stale_after = Duration::from_millis(1);
        let components = Components::open(settings).await.unwrap();

        let job = Job::new("scan.nii.gz", Some("scan.nii.gz".into()));
        components.store.create(&job).await.unwrap();
        components
            .store
            .compare_and_swap_status(&job.id, JobStatus::Pending, StatusChange::start())
            .await
            .unwrap();
        let queue = components.queue().unwrap();
        queue.submit(&job.id).await.unwrap();
        queue.claim("crashed").unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let store = components.store.clone();
        reap(components, false).await.unwrap();
        let job = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("heartbeat lost"));
    }
}
