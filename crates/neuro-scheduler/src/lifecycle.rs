//! Cancellation across both layers: the backend task and the OS processes
//! running the segmentation tool.

use crate::trait_::ExecutionBackend;
use neuro_process::{
    own_process_group, signal_pid, terminate_group, ProcessError, ProcessRecord, ProcessRegistry,
    ProcessSweeper, Signal, SweepReport,
};
use neuro_segment::DockerRuntime;
use neuro_types::{JobId, JobStatus, JobStore, LifecycleSettings, StoreError};
use std::sync::Arc;

/// What an orphan reap found and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// (pid, job) of tool processes whose job is terminal or unknown.
    pub orphans: Vec<(u32, Option<JobId>)>,
    /// Pids signalled (empty on a dry run).
    pub terminated: Vec<u32>,
    pub failed: Vec<u32>,
}

pub struct ProcessLifecycleManager {
    backend: Arc<dyn ExecutionBackend>,
    registry: ProcessRegistry,
    sweeper: ProcessSweeper,
    settings: LifecycleSettings,
    container_cli: String,
}

impl ProcessLifecycleManager {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        registry: ProcessRegistry,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            backend,
            sweeper: ProcessSweeper::new(settings.tool_name.clone()),
            registry,
            settings,
            container_cli: "docker".to_string(),
        }
    }

    /// CLI used to remove named containers.
    pub fn with_container_cli(mut self, cli: impl Into<String>) -> Self {
        self.container_cli = cli.into();
        self
    }

    /// Cancel the job's backend task (interrupting it when the job is running)
    /// and, for a running job, stop its OS processes.
    ///
    /// Returns whether the backend accepted a cancellation signal. Missing
    /// handles, missing processes and permission errors are logged only.
    pub async fn cancel(&self, job_id: &JobId, status: JobStatus) -> bool {
        let running = status == JobStatus::Running;
        let delivered = match self.backend.find(job_id).await {
            Ok(Some(handle)) => match self.backend.cancel(&handle, running).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, task = %handle, error = %e, "backend cancel failed");
                    false
                }
            },
            Ok(None) => {
                tracing::info!(job_id = %job_id, "no backend task found for job");
                false
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "backend lookup failed");
                false
            }
        };

        if running {
            self.stop_processes(job_id).await;
        }
        tracing::info!(job_id = %job_id, %status, delivered, "cancellation requested");
        delivered
    }

    async fn stop_processes(&self, job_id: &JobId) {
        match self.registry.lookup(job_id).await {
            Some(record) => self.stop_recorded(&record).await,
            None => tracing::info!(job_id = %job_id, "no recorded process for job"),
        }
        // The container outlives a killed CLI; the name is deterministic.
        if DockerRuntime::remove_container(&self.container_cli, job_id).await {
            tracing::info!(job_id = %job_id, "removed segmentation container");
        }
        let report = self.sweeper.sweep(job_id, self.settings.kill_grace).await;
        log_sweep(job_id, &report);
    }

    async fn stop_recorded(&self, record: &ProcessRecord) {
        let job_id = record.job_id;
        let result = match record.pgid {
            Some(pgid) if Some(pgid) != own_process_group() => {
                terminate_group(pgid, self.settings.kill_grace).await.map(|o| format!("{:?}", o))
            }
            _ => signal_pid(record.pid, Signal::Term).map(|()| "signalled".to_string()),
        };
        match result {
            Ok(outcome) => tracing::info!(job_id = %job_id, pid = record.pid, pgid = ?record.pgid, %outcome, "stopped recorded process"),
            Err(ProcessError::NotFound(_)) => {
                tracing::info!(job_id = %job_id, pid = record.pid, "recorded process already gone")
            }
            Err(ProcessError::PermissionDenied(pid)) => {
                tracing::warn!(job_id = %job_id, pid, "permission denied stopping recorded process")
            }
            Err(e) => tracing::warn!(job_id = %job_id, pid = record.pid, error = %e, "failed to stop recorded process"),
        }
    }

    /// Find live tool processes whose job is terminal or unknown and kill their
    /// process groups. With `dry_run`, only report.
    pub async fn reap_orphans(&self, store: &dyn JobStore, dry_run: bool) -> Result<ReapReport, StoreError> {
        let own_group = own_process_group();
        let mut report = ReapReport::default();
        for process in self.sweeper.find_tool_processes() {
            let orphaned = match process.job_id {
                Some(id) => match store.load(&id).await? {
                    Some(job) => job.status.is_terminal(),
                    None => true,
                },
                // Tool processes with no job id are left alone.
                None => false,
            };
            if !orphaned {
                continue;
            }
            tracing::info!(pid = process.pid, job_id = ?process.job_id, cmdline = %process.cmdline, dry_run, "orphaned tool process");
            report.orphans.push((process.pid, process.job_id));
            if dry_run {
                continue;
            }
            let result = match process.pgid {
                Some(pgid) if Some(pgid) != own_group => terminate_group(pgid, self.settings.kill_grace).await.map(|_| ()),
                _ => signal_pid(process.pid, Signal::Kill),
            };
            match result {
                Ok(()) | Err(ProcessError::NotFound(_)) => report.terminated.push(process.pid),
                Err(e) => {
                    tracing::warn!(pid = process.pid, error = %e, "failed to reap orphan");
                    report.failed.push(process.pid);
                }
            }
        }
        Ok(report)
    }
}

fn log_sweep(job_id: &JobId, report: &SweepReport) {
    if report.matched == 0 {
        tracing::debug!(job_id = %job_id, "process sweep found nothing");
        return;
    }
    tracing::info!(
        job_id = %job_id,
        matched = report.matched,
        terminated = report.terminated.len(),
        killed = report.killed.len(),
        permission_denied = report.permission_denied.len(),
        "process sweep finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::DirectBackend;
    use crate::trait_::{JobRunner, RunContext};
    use async_trait::async_trait;
    use neuro_store::InMemoryJobStore;
    use neuro_types::{Job, RunError, RunOutcome};
    use std::time::Duration;

    struct Idle;

    #[async_trait]
    impl JobRunner for Idle {
        async fn run(&self, _job_id: &JobId, ctx: &RunContext) -> Result<RunOutcome, RunError> {
            ctx.cancel.cancelled().await;
            Ok(RunOutcome::Cancelled)
        }
    }

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cancel_without_task_or_process_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(DirectBackend::new(Arc::new(Idle), 1));
        let manager = ProcessLifecycleManager::new(backend, ProcessRegistry::new(dir.path()), settings())
            .with_container_cli("no-such-container-cli");
        assert!(!manager.cancel(&JobId::new(), JobStatus::Running).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_running_kills_recorded_group() {
        use std::process::Stdio;

        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path());
        let backend = Arc::new(DirectBackend::new(Arc::new(Idle), 1));
        let job = JobId::new();
        backend.submit(&job).await.unwrap();

        let mut child = neuro_process::command_in_new_group("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        registry
            .register(ProcessRecord::new(job, pid, "test").with_group(pid as i32))
            .await
            .unwrap();

        let manager = ProcessLifecycleManager::new(backend.clone(), registry, settings())
            .with_container_cli("no-such-container-cli");
        // Give the worker a moment to start the task so the cancel is forced.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.cancel(&job, JobStatus::Running).await);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn dry_run_reap_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::new();
        store.create(&Job::new("scan.nii.gz", None)).await.unwrap();
        let backend = Arc::new(DirectBackend::new(Arc::new(Idle), 1));
        let manager = ProcessLifecycleManager::new(backend, ProcessRegistry::new(dir.path()), LifecycleSettings {
            tool_name: "no-such-tool-name-xyz".into(),
            ..settings()
        });
        let report = manager.reap_orphans(&store, true).await.unwrap();
        assert!(report.terminated.is_empty());
    }
}
