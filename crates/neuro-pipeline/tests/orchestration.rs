//! End-to-end runs through a backend, the orchestrator and scripted runtimes.

use async_trait::async_trait;
use neuro_pipeline::{JobControl, Orchestrator, RegenerateError, RESULTS_FILE};
use neuro_process::ProcessRegistry;
use neuro_scheduler::{
    DirectBackend, ExecutionBackend, JobRunner, ProcessLifecycleManager, QueueBackend, QueueWorker,
};
use neuro_segment::{
    write_aseg_stats, ContainerRuntime, Device, ProgressFn, RunRequest, RungError,
    RuntimeUnavailable, Scripted, ScriptedRuntime, SegmentationInvoker,
};
use neuro_store::{InMemoryJobStore, LocalArtifactStorage};
use neuro_types::{
    BackendSettings, InvokerSettings, Job, JobId, JobStatus, JobStep, JobStore, LifecycleSettings,
    Metric, StatusChange, StepKind, StoreError, TimeoutPolicy, CANCELLED_MESSAGE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const INPUT: &str = "scan.nii.gz";

struct Harness {
    dir: TempDir,
    store: Arc<InMemoryJobStore>,
    orchestrator: Arc<Orchestrator>,
    control: JobControl,
}

impl Harness {
    fn uploads(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    fn outputs(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }

    async fn upload(&self) {
        tokio::fs::create_dir_all(self.uploads()).await.unwrap();
        tokio::fs::write(self.uploads().join(INPUT), b"nifti").await.unwrap();
    }

    async fn submit(&self) -> JobId {
        let (job, _) = self
            .control
            .create_and_submit(INPUT, Some(INPUT.to_string()))
            .await
            .unwrap();
        job.id
    }

    async fn wait_for(&self, id: &JobId, pred: impl Fn(&Job) -> bool) -> Job {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(job) = self.store.load(id).await.unwrap() {
                    if pred(&job) {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach the expected state")
    }

    async fn wait_terminal(&self, id: &JobId) -> Job {
        self.wait_for(id, |j| j.status.is_terminal()).await
    }
}

fn invoker_settings() -> InvokerSettings {
    InvokerSettings {
        processing_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn orchestrator(
    dir: &Path,
    store: Arc<dyn JobStore>,
    settings: InvokerSettings,
    primary: Arc<dyn ContainerRuntime>,
    secondary: Arc<dyn ContainerRuntime>,
) -> Orchestrator {
    let storage = Arc::new(LocalArtifactStorage::new(dir.join("uploads"), dir.join("outputs")));
    let invoker = SegmentationInvoker::with_runtimes(settings, dir.join("outputs"), primary, secondary)
        .with_device(Device::Cpu);
    Orchestrator::new(store, storage, Arc::new(invoker))
}

fn harness_with(
    settings: InvokerSettings,
    primary: Arc<dyn ContainerRuntime>,
    secondary: Arc<dyn ContainerRuntime>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryJobStore::new());
    let runner = Arc::new(orchestrator(dir.path(), store.clone(), settings, primary, secondary));
    let backend = Arc::new(DirectBackend::new(runner.clone(), 1));
    let lifecycle = ProcessLifecycleManager::new(
        backend.clone(),
        ProcessRegistry::new(dir.path().join("outputs")),
        LifecycleSettings {
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .with_container_cli("no-such-container-cli");
    let control = JobControl::new(store.clone(), backend, Arc::new(lifecycle));
    Harness {
        dir,
        store,
        orchestrator: runner,
        control,
    }
}

fn harness(primary: Scripted, secondary: Scripted) -> Harness {
    harness_with(
        invoker_settings(),
        Arc::new(ScriptedRuntime::new("docker", primary)),
        Arc::new(ScriptedRuntime::new("apptainer", secondary)),
    )
}

fn docker_not_running() -> Scripted {
    Scripted::Unavailable(RuntimeUnavailable::NotRunning {
        runtime: "docker".into(),
    })
}

fn apptainer_missing() -> Scripted {
    Scripted::Unavailable(RuntimeUnavailable::NotInstalled {
        runtime: "apptainer".into(),
    })
}

async fn progress_trail(store: &InMemoryJobStore, id: &JobId) -> Vec<u8> {
    store
        .steps(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.kind == StepKind::Progress)
        .map(|s| s.progress)
        .collect()
}

#[tokio::test]
async fn falls_through_to_secondary_with_real_metrics() {
    let h = harness(docker_not_running(), Scripted::Succeed { left: 1250.0, right: 1200.0 });
    h.upload().await;
    let id = h.submit().await;
    let job = h.wait_terminal(&id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.error_message.is_none());
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert_eq!(
        job.result_path.as_deref(),
        Some(h.outputs().join(id.to_string()).join("fastsurfer").display().to_string().as_str())
    );

    let metrics = h.store.metrics(&id).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].region, "Hippocampus");
    assert!((metrics[0].asymmetry_index - 0.0204).abs() < 1e-4);

    let steps = h.store.steps(&id).await.unwrap();
    assert!(steps.iter().all(|s| s.kind != StepKind::Placeholder));
    let trail = progress_trail(&h.store, &id).await;
    assert!(trail.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", trail);
    assert!(h.outputs().join(id.to_string()).join(RESULTS_FILE).exists());
}

#[tokio::test]
async fn both_runtimes_unavailable_completes_with_placeholder() {
    let h = harness(docker_not_running(), apptainer_missing());
    h.upload().await;
    let id = h.submit().await;
    let job = h.wait_terminal(&id).await;

    assert_eq!(job.status, JobStatus::Completed);
    let steps = h.store.steps(&id).await.unwrap();
    let placeholder: Vec<_> = steps.iter().filter(|s| s.kind == StepKind::Placeholder).collect();
    assert_eq!(placeholder.len(), 1);
    assert!(placeholder[0].message.contains("Mock data used"));

    let metrics = h.store.metrics(&id).await.unwrap();
    assert_eq!(metrics[0].left_volume, 1250.5);
    assert_eq!(metrics[0].right_volume, 1198.2);

    let results = std::fs::read_to_string(h.outputs().join(id.to_string()).join(RESULTS_FILE)).unwrap();
    assert!(results.contains("\"placeholder\": true"));
}

#[tokio::test]
async fn timeout_late_in_segmentation_degrades_to_placeholder() {
    let primary = ScriptedRuntime::new("docker", Scripted::TimeOut)
        .with_progress([(50, "Segmenting"), (86, "Segmentation nearly done")]);
    let h = harness_with(
        invoker_settings(),
        Arc::new(primary),
        Arc::new(ScriptedRuntime::new("apptainer", apptainer_missing())),
    );
    h.upload().await;
    let id = h.submit().await;
    let job = h.wait_terminal(&id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    let trail = progress_trail(&h.store, &id).await;
    assert!(trail.contains(&86));
    assert!(trail.windows(2).all(|w| w[0] <= w[1]));
    let steps = h.store.steps(&id).await.unwrap();
    assert!(steps
        .iter()
        .any(|s| s.kind == StepKind::Placeholder && s.message.contains("timed out")));
    assert_eq!(h.store.metrics(&id).await.unwrap()[0].left_volume, 1250.5);
}

#[tokio::test]
async fn timeout_fails_job_under_fail_policy() {
    let h = harness_with(
        InvokerSettings {
            timeout_policy: TimeoutPolicy::Fail,
            ..invoker_settings()
        },
        Arc::new(ScriptedRuntime::new("docker", Scripted::TimeOut)),
        Arc::new(ScriptedRuntime::new("apptainer", apptainer_missing())),
    );
    h.upload().await;
    let id = h.submit().await;
    let job = h.wait_terminal(&id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("timed out"));
    assert!(job.result_path.is_none());
    assert!(h.store.metrics(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unsupported_input_fails_without_retry() {
    let h = harness(docker_not_running(), apptainer_missing());
    tokio::fs::create_dir_all(h.uploads()).await.unwrap();
    tokio::fs::write(h.uploads().join("scan.dcm"), b"dicom").await.unwrap();
    let (job, _) = h
        .control
        .create_and_submit("scan.dcm", Some("scan.dcm".into()))
        .await
        .unwrap();
    let job = h.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("unsupported input format"));
}

#[tokio::test]
async fn cancel_pending_and_running_jobs() {
    // One worker: the first job hangs in the runtime, so the second stays queued.
    let h = harness(Scripted::Hang, apptainer_missing());
    h.upload().await;
    let running = h.submit().await;
    h.wait_for(&running, |j| j.status == JobStatus::Running && j.progress >= 15)
        .await;
    let queued = h.submit().await;

    let cancel = h.control.cancel(&queued).await.unwrap();
    assert_eq!(cancel.previous, JobStatus::Pending);
    assert!(cancel.cancelled && cancel.signal_delivered);

    let cancel = h.control.cancel(&running).await.unwrap();
    assert_eq!(cancel.previous, JobStatus::Running);
    assert!(cancel.signal_delivered);

    let job = h.wait_terminal(&running).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some(CANCELLED_MESSAGE));

    // Give the worker time to (not) pick up the revoked job.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = h.store.load(&queued).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
    assert!(h.store.metrics(&queued).await.unwrap().is_empty());
    assert!(h
        .store
        .steps(&queued)
        .await
        .unwrap()
        .iter()
        .all(|s| s.message != "Job started"));

    let again = h.control.cancel(&queued).await.unwrap();
    assert!(!again.cancelled);
}

/// Writes complete output, then keeps running until interrupted.
struct OutputThenWait;

#[async_trait]
impl ContainerRuntime for OutputThenWait {
    fn name(&self) -> &str {
        "docker"
    }

    async fn probe(&self, _progress: &ProgressFn) -> Result<(), RuntimeUnavailable> {
        Ok(())
    }

    async fn run(
        &self,
        req: &RunRequest,
        _progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RungError> {
        write_aseg_stats(&req.seg_dir, &req.job_id, 1250.0, 1200.0)
            .await
            .map_err(|e| RungError::Io {
                runtime: "docker".into(),
                source: e,
            })?;
        cancel.cancelled().await;
        Ok(req.seg_dir.clone())
    }
}

#[tokio::test]
async fn cancel_after_output_written_never_completes() {
    let h = harness_with(
        invoker_settings(),
        Arc::new(OutputThenWait),
        Arc::new(ScriptedRuntime::new("apptainer", apptainer_missing())),
    );
    h.upload().await;
    let id = h.submit().await;
    let stats = h
        .outputs()
        .join(id.to_string())
        .join("fastsurfer")
        .join(id.to_string())
        .join("stats/aseg+DKT.stats");
    tokio::time::timeout(Duration::from_secs(10), async {
        while !stats.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    h.control.cancel(&id).await.unwrap();
    let job = h.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_path.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.metrics(&id).await.unwrap().is_empty());
    assert_eq!(h.store.load(&id).await.unwrap().unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn submit_requires_pending_job() {
    let h = harness(docker_not_running(), apptainer_missing());
    h.upload().await;
    let id = h.submit().await;
    h.wait_terminal(&id).await;
    assert!(matches!(
        h.control.submit(&id).await,
        Err(neuro_pipeline::ControlError::NotPending(_, JobStatus::Completed))
    ));
}

#[tokio::test]
async fn queue_retries_upload_race_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryJobStore::new());
    let runner: Arc<dyn JobRunner> = Arc::new(orchestrator(
        dir.path(),
        store.clone(),
        invoker_settings(),
        Arc::new(ScriptedRuntime::new("docker", Scripted::Succeed { left: 1250.0, right: 1200.0 })),
        Arc::new(ScriptedRuntime::new("apptainer", apptainer_missing())),
    ));
    let queue = QueueBackend::open_in_memory(BackendSettings {
        retry_backoff: Duration::ZERO,
        ..Default::default()
    })
    .unwrap();
    let worker = QueueWorker::new(queue.clone(), runner, "w0");

    let job = Job::new(INPUT, Some(INPUT.to_string()));
    store.create(&job).await.unwrap();
    queue.submit(&job.id).await.unwrap();

    // Input not visible yet: transient, the job stays RUNNING for the retry.
    assert!(worker.run_once().await.unwrap());
    let first = store.load(&job.id).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Running);
    assert!(first.error_message.is_none());

    tokio::fs::create_dir_all(dir.path().join("uploads")).await.unwrap();
    tokio::fs::write(dir.path().join("uploads").join(INPUT), b"nifti").await.unwrap();
    assert!(worker.run_once().await.unwrap());

    let done = store.load(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.started_at, first.started_at);
    assert_eq!(queue.describe(&job.id).unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn direct_backend_does_not_retry_upload_race() {
    let h = harness(docker_not_running(), apptainer_missing());
    let id = h.submit().await;
    let job = h.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("input not found"));
}

#[tokio::test]
async fn queue_settles_job_whose_last_worker_died() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryJobStore::new());
    let runner: Arc<dyn JobRunner> = Arc::new(orchestrator(
        dir.path(),
        store.clone(),
        invoker_settings(),
        Arc::new(ScriptedRuntime::new("docker", Scripted::Succeed { left: 1250.0, right: 1200.0 })),
        Arc::new(ScriptedRuntime::new("apptainer", apptainer_missing())),
    ));
    let queue = QueueBackend::open_in_memory(BackendSettings {
        max_attempts: 2,
        retry_backoff: Duration::ZERO,
        stale_after: Duration::from_millis(1),
        ..Default::default()
    })
    .unwrap();
    let worker = QueueWorker::new(queue.clone(), runner, "w0");

    let job = Job::new(INPUT, Some(INPUT.to_string()));
    store.create(&job).await.unwrap();
    queue.submit(&job.id).await.unwrap();

    // No upload: the first attempt is a transient failure and leaves the job RUNNING.
    assert!(worker.run_once().await.unwrap());
    assert_eq!(store.load(&job.id).await.unwrap().unwrap().status, JobStatus::Running);

    // The last attempt is claimed by a worker that never heartbeats again.
    let claimed = queue.claim("crashed").unwrap().unwrap();
    assert_eq!(claimed.attempt, 2);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!worker.run_once().await.unwrap());
    let settled = store.load(&job.id).await.unwrap().unwrap();
    assert_eq!(settled.status, JobStatus::Failed);
    assert!(settled.error_message.unwrap().contains("heartbeat lost"));
    assert!(settled.completed_at.is_some());
    assert_eq!(queue.describe(&job.id).unwrap().unwrap().state, "failed");
    assert!(queue.abandoned().unwrap().is_empty());
    assert!(store.metrics(&job.id).await.unwrap().is_empty());
}

/// Delegates to an in-memory store, but fails the job right after its metrics
/// land, as a concurrent actor would.
struct FailsAfterMetrics {
    inner: InMemoryJobStore,
}

#[async_trait]
impl JobStore for FailsAfterMetrics {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.create(job).await
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.inner.load(id).await
    }

    async fn compare_and_swap_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        change: StatusChange,
    ) -> Result<bool, StoreError> {
        self.inner.compare_and_swap_status(id, expected, change).await
    }

    async fn update_progress(&self, id: &JobId, percent: u8, step: &str) -> Result<bool, StoreError> {
        self.inner.update_progress(id, percent, step).await
    }

    async fn record_step(&self, id: &JobId, step: JobStep) -> Result<(), StoreError> {
        self.inner.record_step(id, step).await
    }

    async fn steps(&self, id: &JobId) -> Result<Vec<JobStep>, StoreError> {
        self.inner.steps(id).await
    }

    async fn replace_metrics(&self, id: &JobId, metrics: &[Metric]) -> Result<(), StoreError> {
        self.inner.replace_metrics(id, metrics).await?;
        if !metrics.is_empty() {
            self.inner
                .compare_and_swap_status(id, JobStatus::Running, StatusChange::fail("failed by operator"))
                .await?;
        }
        Ok(())
    }

    async fn metrics(&self, id: &JobId) -> Result<Vec<Metric>, StoreError> {
        self.inner.metrics(id).await
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        self.inner.list(status).await
    }
}

#[tokio::test]
async fn metrics_cleared_when_job_failed_by_another_actor() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FailsAfterMetrics {
        inner: InMemoryJobStore::new(),
    });
    let runner: Arc<dyn JobRunner> = Arc::new(orchestrator(
        dir.path(),
        store.clone(),
        invoker_settings(),
        Arc::new(ScriptedRuntime::new("docker", Scripted::Succeed { left: 1250.0, right: 1200.0 })),
        Arc::new(ScriptedRuntime::new("apptainer", apptainer_missing())),
    ));
    let queue = QueueBackend::open_in_memory(BackendSettings::default()).unwrap();
    let worker = QueueWorker::new(queue.clone(), runner, "w0");

    tokio::fs::create_dir_all(dir.path().join("uploads")).await.unwrap();
    tokio::fs::write(dir.path().join("uploads").join(INPUT), b"nifti").await.unwrap();
    let job = Job::new(INPUT, Some(INPUT.to_string()));
    store.create(&job).await.unwrap();
    queue.submit(&job.id).await.unwrap();
    assert!(worker.run_once().await.unwrap());

    let job = store.load(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("failed by operator"));
    assert!(job.result_path.is_none());
    assert!(store.metrics(&job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn regenerate_rereads_output_of_completed_job() {
    let h = harness(Scripted::Succeed { left: 1250.0, right: 1200.0 }, apptainer_missing());
    h.upload().await;
    let id = h.submit().await;
    assert_eq!(h.wait_terminal(&id).await.status, JobStatus::Completed);

    // Stats corrected on disk after the run.
    let seg_dir = h.outputs().join(id.to_string()).join("fastsurfer");
    write_aseg_stats(&seg_dir, &id, 1300.0, 1200.0).await.unwrap();

    let metrics = h.orchestrator.regenerate(&id).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].left_volume, 1300.0);
    let stored = h.store.metrics(&id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].left_volume, 1300.0);

    let results = std::fs::read_to_string(h.outputs().join(id.to_string()).join(RESULTS_FILE)).unwrap();
    assert!(results.contains("1300"));
    assert!(results.contains("\"source\": \"existing\""));
    assert!(h
        .store
        .steps(&id)
        .await
        .unwrap()
        .iter()
        .any(|s| s.kind == StepKind::Note && s.message.starts_with("Metrics regenerated")));
    assert_eq!(h.store.load(&id).await.unwrap().unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn regenerate_requires_completed_job() {
    let h = harness(docker_not_running(), apptainer_missing());
    let job = Job::new(INPUT, Some(INPUT.to_string()));
    h.store.create(&job).await.unwrap();
    assert!(matches!(
        h.orchestrator.regenerate(&job.id).await,
        Err(RegenerateError::NotCompleted(_, JobStatus::Pending))
    ));
    assert!(matches!(
        h.orchestrator.regenerate(&JobId::new()).await,
        Err(RegenerateError::NotFound(_))
    ));
}
