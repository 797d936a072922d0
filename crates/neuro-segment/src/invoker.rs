//! The fallback ladder: primary runtime, secondary runtime, placeholder.

use crate::apptainer::ApptainerRuntime;
use crate::docker::DockerRuntime;
use crate::error::{InvokeError, RungError, RuntimeUnavailable};
use crate::gpu::{available_cpus, detect_gpu, thread_count, Device};
use crate::host_paths::HostPaths;
use crate::placeholder::{placeholder_reason, write_placeholder};
use crate::runtime::{ContainerRuntime, ProgressFn, RunRequest, RungOutcome};
use crate::SUPPORTED_SUFFIXES;
use neuro_process::ProcessRegistry;
use neuro_types::{InvokerSettings, JobId, TimeoutPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Directory under the job's output directory that the tool writes into.
const SEG_SUBDIR: &str = "fastsurfer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rung {
    Primary,
    Secondary,
}

impl Rung {
    pub fn as_str(self) -> &'static str {
        match self {
            Rung::Primary => "primary",
            Rung::Secondary => "secondary",
        }
    }
}

/// Where the output came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSource {
    Runtime { rung: Rung, runtime: String },
    Placeholder { reason: String },
    /// Left on disk by an earlier run and read back as-is.
    Existing,
}

impl OutputSource {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, OutputSource::Placeholder { .. })
    }
}

/// Result of one invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Subjects directory: output lives at `<output_dir>/<job_id>/`.
    pub output_dir: PathBuf,
    /// The job's private output directory.
    pub job_dir: PathBuf,
    pub source: OutputSource,
}

pub struct SegmentationInvoker {
    settings: InvokerSettings,
    output_root: PathBuf,
    primary: Arc<dyn ContainerRuntime>,
    secondary: Arc<dyn ContainerRuntime>,
    device: OnceCell<Device>,
}

impl SegmentationInvoker {
    /// Docker as primary, apptainer/singularity as secondary.
    pub fn new(
        settings: InvokerSettings,
        output_root: impl Into<PathBuf>,
        host_paths: HostPaths,
        registry: ProcessRegistry,
    ) -> Self {
        let primary = Arc::new(DockerRuntime::new(&settings, host_paths, registry.clone()));
        let secondary = Arc::new(ApptainerRuntime::new(&settings, registry));
        Self::with_runtimes(settings, output_root, primary, secondary)
    }

    pub fn with_runtimes(
        settings: InvokerSettings,
        output_root: impl Into<PathBuf>,
        primary: Arc<dyn ContainerRuntime>,
        secondary: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            settings,
            output_root: output_root.into(),
            primary,
            secondary,
            device: OnceCell::new(),
        }
    }

    /// Skip GPU probing (tests, or hosts known to have no GPU).
    pub fn with_device(self, device: Device) -> Self {
        let _ = self.device.set(device);
        self
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.output_root.join(job_id.to_string())
    }

    /// The output an earlier run left for `job_id`, without running anything.
    pub async fn existing_output(&self, job_id: &JobId) -> Option<Invocation> {
        let job_dir = self.job_dir(job_id);
        let seg_dir = job_dir.join(SEG_SUBDIR);
        if !tokio::fs::metadata(seg_dir.join(job_id.to_string()))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return None;
        }
        let source = match placeholder_reason(&seg_dir, job_id).await {
            Some(reason) => OutputSource::Placeholder { reason },
            None => OutputSource::Existing,
        };
        Some(Invocation {
            output_dir: seg_dir,
            job_dir,
            source,
        })
    }

    fn check_input(input: &Path) -> Result<(), InvokeError> {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !SUPPORTED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return Err(InvokeError::UnsupportedInput(input.to_path_buf()));
        }
        if !input.is_file() {
            return Err(InvokeError::InputMissing(input.to_path_buf()));
        }
        Ok(())
    }

    async fn attempt(
        runtime: &dyn ContainerRuntime,
        req: &RunRequest,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> RungOutcome {
        if let Err(reason) = runtime.probe(progress).await {
            return RungOutcome::Unavailable(reason);
        }
        match runtime.run(req, progress, cancel).await {
            Ok(dir) => RungOutcome::Success(dir),
            Err(RungError::Unavailable(reason)) => RungOutcome::Unavailable(reason),
            Err(e) => RungOutcome::Failed(e),
        }
    }

    async fn placeholder(
        &self,
        seg_dir: &Path,
        job_dir: PathBuf,
        job_id: &JobId,
        reason: String,
        progress: &ProgressFn,
    ) -> Result<Invocation, InvokeError> {
        progress(20, "Generating placeholder segmentation output");
        let output_dir = write_placeholder(seg_dir, job_id, &reason)
            .await
            .map_err(InvokeError::Placeholder)?;
        progress(60, "Placeholder segmentation written");
        Ok(Invocation {
            output_dir,
            job_dir,
            source: OutputSource::Placeholder { reason },
        })
    }

    /// Run the tool once against `input`, degrading through the ladder.
    pub async fn invoke(
        &self,
        input: &Path,
        job_id: &JobId,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvokeError> {
        Self::check_input(input)?;
        let job_dir = self.job_dir(job_id);
        let seg_dir = job_dir.join(SEG_SUBDIR);
        tokio::fs::create_dir_all(&seg_dir).await?;

        if self.settings.smoke_test {
            tracing::info!(job_id = %job_id, "smoke test mode, skipping container runtimes");
            return self
                .placeholder(&seg_dir, job_dir, job_id, "smoke test mode".to_string(), progress)
                .await;
        }

        progress(17, "Detecting compute resources");
        let device = *self.device.get_or_init(detect_gpu).await;
        let threads = thread_count(device, available_cpus());
        let req = RunRequest {
            job_id: *job_id,
            input: input.to_path_buf(),
            seg_dir: seg_dir.clone(),
            device,
            threads,
            timeout: self.settings.processing_timeout,
            kill_grace: self.settings.kill_grace,
        };

        let mut unavailable: Vec<RuntimeUnavailable> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for (rung, runtime) in [
            (Rung::Primary, &self.primary),
            (Rung::Secondary, &self.secondary),
        ] {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }
            let name = runtime.name().to_string();
            match Self::attempt(runtime.as_ref(), &req, progress, cancel).await {
                RungOutcome::Success(output_dir) => {
                    tracing::info!(job_id = %job_id, rung = rung.as_str(), runtime = %name, "segmentation complete");
                    progress(60, "Brain segmentation complete");
                    return Ok(Invocation {
                        output_dir,
                        job_dir,
                        source: OutputSource::Runtime { rung, runtime: name },
                    });
                }
                RungOutcome::Unavailable(reason) => {
                    tracing::warn!(job_id = %job_id, rung = rung.as_str(), runtime = %name, %reason, "runtime unavailable");
                    unavailable.push(reason);
                }
                RungOutcome::Failed(RungError::Cancelled) => return Err(InvokeError::Cancelled),
                RungOutcome::Failed(RungError::TimedOut { runtime, after }) => {
                    return match self.settings.timeout_policy {
                        TimeoutPolicy::Placeholder => {
                            let reason = format!("{} timed out after {}s", runtime, after.as_secs());
                            self.placeholder(&seg_dir, job_dir, job_id, reason, progress).await
                        }
                        TimeoutPolicy::Fail => Err(InvokeError::TimedOut(after)),
                    };
                }
                RungOutcome::Failed(e) => {
                    tracing::error!(job_id = %job_id, rung = rung.as_str(), runtime = %name, error = %e, "runtime failed");
                    failures.push(e.to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        let reasons: Vec<String> = unavailable
            .iter()
            .map(ToString::to_string)
            .chain(failures.iter().cloned())
            .collect();
        if !self.settings.placeholder_when_unavailable {
            return Err(match (failures.is_empty(), unavailable.into_iter().next()) {
                (true, Some(primary_reason)) => InvokeError::Unavailable(primary_reason),
                _ => InvokeError::Exhausted(reasons.join("; ")),
            });
        }
        self.placeholder(&seg_dir, job_dir, job_id, reasons.join("; "), progress)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{Scripted, ScriptedRuntime};
    use std::sync::Mutex;
    use std::time::Duration;

    fn settings() -> InvokerSettings {
        InvokerSettings {
            processing_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn input(dir: &Path) -> PathBuf {
        let path = dir.join("uploads").join("scan.nii.gz");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"nifti").await.unwrap();
        path
    }

    fn not_running() -> Scripted {
        Scripted::Unavailable(RuntimeUnavailable::NotRunning {
            runtime: "docker".into(),
        })
    }

    #[tokio::test]
    async fn falls_through_to_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(ScriptedRuntime::new("docker", not_running()));
        let secondary = Arc::new(ScriptedRuntime::new(
            "apptainer",
            Scripted::Succeed { left: 3000.0, right: 2900.0 },
        ));
        let invoker = SegmentationInvoker::with_runtimes(
            settings(),
            dir.path().join("out"),
            primary.clone(),
            secondary.clone(),
        )
        .with_device(Device::Cpu);
        let job_id = JobId::new();
        let inv = invoker
            .invoke(&input(dir.path()).await, &job_id, &|_, _| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            inv.source,
            OutputSource::Runtime { rung: Rung::Secondary, runtime: "apptainer".into() }
        );
        assert_eq!(primary.runs(), 0);
        assert_eq!(secondary.runs(), 1);
        assert!(!inv
            .output_dir
            .join(job_id.to_string())
            .join(crate::PLACEHOLDER_MARKER)
            .exists());
    }

    #[tokio::test]
    async fn both_unavailable_uses_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = SegmentationInvoker::with_runtimes(
            settings(),
            dir.path().join("out"),
            Arc::new(ScriptedRuntime::new("docker", not_running())),
            Arc::new(ScriptedRuntime::new(
                "apptainer",
                Scripted::Unavailable(RuntimeUnavailable::NotInstalled { runtime: "apptainer".into() }),
            )),
        )
        .with_device(Device::Cpu);
        let job_id = JobId::new();
        let steps = Arc::new(Mutex::new(Vec::new()));
        let steps_in = Arc::clone(&steps);
        let record = move |p: u8, s: &str| steps_in.lock().unwrap().push((p, s.to_string()));
        let inv = invoker
            .invoke(&input(dir.path()).await, &job_id, &record, &CancellationToken::new())
            .await
            .unwrap();
        match inv.source {
            OutputSource::Placeholder { reason } => {
                assert!(reason.contains("not running"));
                assert!(reason.contains("not installed"));
            }
            other => panic!("expected placeholder, got {:?}", other),
        }
        assert!(steps.lock().unwrap().iter().any(|(p, _)| *p == 60));
    }

    #[tokio::test]
    async fn unavailable_without_placeholder_reports_primary_reason() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = SegmentationInvoker::with_runtimes(
            InvokerSettings { placeholder_when_unavailable: false, ..settings() },
            dir.path().join("out"),
            Arc::new(ScriptedRuntime::new("docker", not_running())),
            Arc::new(ScriptedRuntime::new("apptainer", not_running())),
        )
        .with_device(Device::Cpu);
        let err = invoker
            .invoke(&input(dir.path()).await, &JobId::new(), &|_, _| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Unavailable(RuntimeUnavailable::NotRunning { .. })));
    }

    #[tokio::test]
    async fn timeout_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        let input = input(dir.path()).await;
        for (policy, expect_placeholder) in [(TimeoutPolicy::Placeholder, true), (TimeoutPolicy::Fail, false)] {
            let secondary = Arc::new(ScriptedRuntime::new("apptainer", Scripted::Succeed { left: 1.0, right: 1.0 }));
            let invoker = SegmentationInvoker::with_runtimes(
                InvokerSettings { timeout_policy: policy, ..settings() },
                dir.path().join("out"),
                Arc::new(ScriptedRuntime::new("docker", Scripted::TimeOut)),
                secondary.clone(),
            )
            .with_device(Device::Cpu);
            let result = invoker
                .invoke(&input, &JobId::new(), &|_, _| {}, &CancellationToken::new())
                .await;
            if expect_placeholder {
                assert!(result.unwrap().source.is_placeholder());
            } else {
                assert!(matches!(result, Err(InvokeError::TimedOut(_))));
            }
            // A timeout never falls through to the next runtime.
            assert_eq!(secondary.runs(), 0);
        }
    }

    #[tokio::test]
    async fn cancellation_stops_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let secondary = Arc::new(ScriptedRuntime::new("apptainer", Scripted::Succeed { left: 1.0, right: 1.0 }));
        let invoker = SegmentationInvoker::with_runtimes(
            settings(),
            dir.path().join("out"),
            Arc::new(ScriptedRuntime::new("docker", Scripted::Hang)),
            secondary.clone(),
        )
        .with_device(Device::Cpu);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = invoker
            .invoke(&input(dir.path()).await, &JobId::new(), &|_, _| {}, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
        assert_eq!(secondary.runs(), 0);
    }

    #[tokio::test]
    async fn existing_output_reads_back_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = SegmentationInvoker::with_runtimes(
            settings(),
            dir.path().join("out"),
            Arc::new(ScriptedRuntime::new("docker", Scripted::Succeed { left: 2.0, right: 1.0 })),
            Arc::new(ScriptedRuntime::new("apptainer", not_running())),
        )
        .with_device(Device::Cpu);
        let real = JobId::new();
        invoker
            .invoke(&input(dir.path()).await, &real, &|_, _| {}, &CancellationToken::new())
            .await
            .unwrap();
        let found = invoker.existing_output(&real).await.unwrap();
        assert_eq!(found.source, OutputSource::Existing);
        assert_eq!(found.job_dir, invoker.job_dir(&real));

        let fake = JobId::new();
        let seg_dir = invoker.job_dir(&fake).join(SEG_SUBDIR);
        write_placeholder(&seg_dir, &fake, "smoke test mode").await.unwrap();
        assert_eq!(
            invoker.existing_output(&fake).await.unwrap().source,
            OutputSource::Placeholder { reason: "smoke test mode".into() }
        );

        assert!(invoker.existing_output(&JobId::new()).await.is_none());
    }

    #[tokio::test]
    async fn rejects_unsupported_input() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = SegmentationInvoker::with_runtimes(
            settings(),
            dir.path(),
            Arc::new(ScriptedRuntime::new("docker", not_running())),
            Arc::new(ScriptedRuntime::new("apptainer", not_running())),
        );
        let err = invoker
            .invoke(Path::new("/tmp/scan.dcm"), &JobId::new(), &|_, _| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UnsupportedInput(_)));
    }
}
