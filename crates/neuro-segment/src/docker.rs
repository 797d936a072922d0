//! Primary rung: the docker engine.

use crate::error::{RungError, RuntimeUnavailable};
use crate::exec::{launch, supervise, Stopped};
use crate::host_paths::HostPaths;
use crate::runtime::{ContainerRuntime, ProgressFn, RunRequest};
use crate::ASEG_STATS;
use async_trait::async_trait;
use neuro_process::ProcessRegistry;
use neuro_types::{InvokerSettings, JobId};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const NAME: &str = "docker";
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const IMAGES_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the tool image with `docker run`, under a container name derived from the job.
pub struct DockerRuntime {
    binary: String,
    image: String,
    pull_missing: bool,
    pull_timeout: Duration,
    force_root: bool,
    host_paths: HostPaths,
    registry: ProcessRegistry,
}

impl DockerRuntime {
    pub fn new(settings: &InvokerSettings, host_paths: HostPaths, registry: ProcessRegistry) -> Self {
        Self {
            binary: NAME.to_string(),
            image: settings.image.clone(),
            pull_missing: settings.pull_missing_image,
            pull_timeout: settings.pull_timeout,
            force_root: settings.force_root,
            host_paths,
            registry,
        }
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Deterministic container name, so cancellation can remove the container itself.
    pub fn container_name(job_id: &JobId) -> String {
        format!("neuro-seg-{}", job_id)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn unavailable_not_running(&self) -> RuntimeUnavailable {
        RuntimeUnavailable::NotRunning {
            runtime: self.binary.clone(),
        }
    }

    /// Arguments for `docker run`, with mounts translated to host paths.
    pub fn run_args(&self, req: &RunRequest) -> Vec<String> {
        let input_dir = req
            .input
            .parent()
            .map(|p| self.host_paths.translate(p))
            .unwrap_or_default();
        let output_dir = self.host_paths.translate(&req.seg_dir);

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(&req.job_id),
        ];
        if req.device.is_gpu() {
            args.extend(["--gpus".to_string(), "all".to_string()]);
        }
        if self.force_root {
            args.extend(["--user".to_string(), "root".to_string()]);
        }
        args.extend([
            "-v".to_string(),
            format!("{}:/input:ro", input_dir.display()),
            "-v".to_string(),
            format!("{}:/output", output_dir.display()),
            self.image.clone(),
        ]);
        args.extend(req.tool_args());
        if self.force_root {
            args.push("--allow_root".to_string());
        }
        args
    }

    async fn has_image(&self) -> Result<bool, RuntimeUnavailable> {
        let out = self
            .command()
            .args(["images", "-q", &self.image])
            .output();
        match tokio::time::timeout(IMAGES_TIMEOUT, out).await {
            Ok(Ok(out)) if out.status.success() => {
                Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
            }
            Ok(Ok(_)) | Err(_) => Err(self.unavailable_not_running()),
            Ok(Err(e)) => Err(RuntimeUnavailable::ImageMissing {
                runtime: self.binary.clone(),
                image: self.image.clone(),
                detail: e.to_string(),
            }),
        }
    }

    async fn pull(&self, progress: &ProgressFn) -> Result<(), RuntimeUnavailable> {
        progress(
            15,
            "Downloading segmentation model (first run only, this can take a while)",
        );
        tracing::info!(image = %self.image, "pulling segmentation image");
        let out = self.command().args(["pull", &self.image]).output();
        let missing = |detail: String| RuntimeUnavailable::ImageMissing {
            runtime: self.binary.clone(),
            image: self.image.clone(),
            detail,
        };
        match tokio::time::timeout(self.pull_timeout, out).await {
            Ok(Ok(out)) if out.status.success() => {
                tracing::info!(image = %self.image, "segmentation image ready");
                Ok(())
            }
            Ok(Ok(out)) => Err(missing(format!(
                "pull failed, check network access: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Ok(Err(e)) => Err(missing(e.to_string())),
            Err(_) => Err(missing(format!(
                "pull timed out after {}s",
                self.pull_timeout.as_secs()
            ))),
        }
    }

    /// Force-remove the job's container; killing the CLI alone leaves it running.
    pub async fn remove_container(binary: &str, job_id: &JobId) -> bool {
        let name = Self::container_name(job_id);
        let out = Command::new(binary)
            .args(["rm", "-f", &name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(Duration::from_secs(30), out).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn probe(&self, progress: &ProgressFn) -> Result<(), RuntimeUnavailable> {
        let version = self
            .command()
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match tokio::time::timeout(CHECK_TIMEOUT, version).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(_)) => return Err(self.unavailable_not_running()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeUnavailable::NotInstalled {
                    runtime: self.binary.clone(),
                })
            }
            Ok(Err(_)) | Err(_) => return Err(self.unavailable_not_running()),
        }

        if self.has_image().await? {
            return Ok(());
        }
        if !self.pull_missing {
            return Err(RuntimeUnavailable::ImageMissing {
                runtime: self.binary.clone(),
                image: self.image.clone(),
                detail: "image not present and pulling is disabled".to_string(),
            });
        }
        self.pull(progress).await
    }

    async fn run(
        &self,
        req: &RunRequest,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RungError> {
        // A previous attempt of the same job may have left its container behind.
        Self::remove_container(&self.binary, &req.job_id).await;

        let mut cmd = neuro_process::command_in_new_group(&self.binary);
        cmd.args(self.run_args(req));
        tracing::info!(job_id = %req.job_id, device = req.device.as_str(), threads = req.threads, "running segmentation container");
        progress(20, "Running brain segmentation (docker)");

        let name = Self::container_name(&req.job_id);
        let launched = launch(&self.binary, cmd, &self.registry, req.job_id, Some(name)).await?;
        let result = supervise(&self.binary, launched, req, cancel).await;
        self.registry.unregister(&req.job_id).await;

        let finished = match result? {
            Ok(finished) => finished,
            Err(stopped) => {
                if !Self::remove_container(&self.binary, &req.job_id).await {
                    tracing::debug!(job_id = %req.job_id, "no container to remove");
                }
                return Err(match stopped {
                    Stopped::TimedOut => RungError::TimedOut {
                        runtime: self.binary.clone(),
                        after: req.timeout,
                    },
                    Stopped::Cancelled => RungError::Cancelled,
                });
            }
        };

        if !finished.status.success() {
            if finished
                .stderr_tail
                .to_lowercase()
                .contains("cannot connect to the docker daemon")
            {
                return Err(RungError::Unavailable(self.unavailable_not_running()));
            }
            return Err(RungError::Exit {
                runtime: self.binary.clone(),
                code: finished.status.code(),
                stderr: finished.stderr_tail,
            });
        }

        let expected = req.seg_dir.join(req.job_id.to_string()).join(ASEG_STATS);
        if tokio::fs::metadata(&expected).await.is_err() {
            return Err(RungError::MissingOutput {
                runtime: self.binary.clone(),
                expected,
            });
        }
        Ok(req.seg_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Device;
    use neuro_types::StorageSettings;
    use std::path::Path;

    #[test]
    fn run_args_mount_input_and_output() {
        let settings = InvokerSettings {
            force_root: true,
            ..Default::default()
        };
        let host = HostPaths::identity(&StorageSettings::default());
        let runtime = DockerRuntime::new(&settings, host, ProcessRegistry::new("/data/outputs"));
        let job_id = JobId::new();
        let seg_dir = Path::new("/data/outputs")
            .join(job_id.to_string())
            .join("fastsurfer");
        let req = RunRequest {
            job_id,
            input: PathBuf::from("/data/uploads/scan.nii.gz"),
            seg_dir: seg_dir.clone(),
            device: Device::Cuda,
            threads: 1,
            timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(1),
        };
        let args = runtime.run_args(&req);
        let joined = args.join(" ");
        assert!(joined.starts_with(&format!(
            "run --rm --name neuro-seg-{} --gpus all --user root",
            job_id
        )));
        assert!(joined.contains("-v /data/uploads:/input:ro"));
        assert!(joined.contains(&format!("-v {}:/output", seg_dir.display())));
        assert!(joined.contains("deepmi/fastsurfer:latest --t1 /input/scan.nii.gz"));
        assert!(joined.contains(&format!(
            "--sid {} --sd /output --seg_only --device cuda --batch 1 --threads 1",
            job_id
        )));
        assert_eq!(args.last().map(String::as_str), Some("--allow_root"));
    }

    #[tokio::test]
    async fn missing_binary_is_not_installed() {
        let runtime = DockerRuntime::new(
            &InvokerSettings::default(),
            HostPaths::identity(&StorageSettings::default()),
            ProcessRegistry::new("/tmp"),
        )
        .with_binary("definitely-not-a-container-engine");
        let noop: &ProgressFn = &|_, _| {};
        let err = runtime.probe(noop).await.unwrap_err();
        assert!(matches!(err, RuntimeUnavailable::NotInstalled { .. }));
    }
}
