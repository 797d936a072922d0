//! Secondary rung: singularity / apptainer running a `.sif` image as a child process.

use crate::error::{RungError, RuntimeUnavailable};
use crate::exec::{launch, supervise, Stopped};
use crate::runtime::{ContainerRuntime, ProgressFn, RunRequest};
use crate::ASEG_STATS;
use async_trait::async_trait;
use neuro_process::ProcessRegistry;
use neuro_types::InvokerSettings;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const BINARIES: [&str; 2] = ["singularity", "apptainer"];
const ENTRYPOINT: &str = "/fastsurfer/run_fastsurfer.sh";

pub struct ApptainerRuntime {
    binaries: Vec<String>,
    image: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
    /// Directories searched for the binary; `PATH` when unset.
    bin_dirs: Option<Vec<PathBuf>>,
    registry: ProcessRegistry,
}

impl ApptainerRuntime {
    pub fn new(settings: &InvokerSettings, registry: ProcessRegistry) -> Self {
        Self {
            binaries: BINARIES.iter().map(|b| b.to_string()).collect(),
            image: settings.sif_image.clone(),
            search_paths: settings.sif_search_paths.clone(),
            bin_dirs: None,
            registry,
        }
    }

    pub fn with_binaries(mut self, binaries: Vec<String>) -> Self {
        self.binaries = binaries;
        self
    }

    pub fn with_bin_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.bin_dirs = Some(dirs);
        self
    }

    /// First runtime binary found in the search directories.
    fn binary(&self) -> Option<PathBuf> {
        let dirs = match &self.bin_dirs {
            Some(dirs) => dirs.clone(),
            None => std::env::split_paths(&std::env::var_os("PATH")?).collect(),
        };
        self.binaries.iter().find_map(|name| {
            dirs.iter()
                .map(|dir| dir.join(name))
                .find(|candidate| is_executable(candidate))
        })
    }

    /// Configured image if it exists, else the first existing search path.
    fn image(&self) -> Option<PathBuf> {
        self.image
            .iter()
            .chain(self.search_paths.iter())
            .find(|p| p.is_file())
            .cloned()
    }

    pub fn exec_args(&self, image: &Path, req: &RunRequest) -> Vec<String> {
        let input_dir = req
            .input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut args = vec!["exec".to_string()];
        if req.device.is_gpu() {
            args.push("--nv".to_string());
        }
        args.extend([
            "--bind".to_string(),
            format!("{}:/input:ro", input_dir.display()),
            "--bind".to_string(),
            format!("{}:/output", req.seg_dir.display()),
            "--env".to_string(),
            "TQDM_DISABLE=1".to_string(),
            "--cleanenv".to_string(),
            image.display().to_string(),
            ENTRYPOINT.to_string(),
        ]);
        args.extend(req.tool_args());
        args
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[async_trait]
impl ContainerRuntime for ApptainerRuntime {
    fn name(&self) -> &str {
        "apptainer"
    }

    async fn probe(&self, _progress: &ProgressFn) -> Result<(), RuntimeUnavailable> {
        if self.binary().is_none() {
            return Err(RuntimeUnavailable::NotInstalled {
                runtime: self.binaries.join("/"),
            });
        }
        if self.image().is_none() {
            return Err(RuntimeUnavailable::ImageMissing {
                runtime: self.name().to_string(),
                image: self
                    .image
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "fastsurfer.sif".to_string()),
                detail: "no .sif image at the configured or default locations".to_string(),
            });
        }
        Ok(())
    }

    async fn run(
        &self,
        req: &RunRequest,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RungError> {
        let (binary, image) = match (self.binary(), self.image()) {
            (Some(b), Some(i)) => (b, i),
            _ => {
                return Err(RungError::Unavailable(RuntimeUnavailable::NotInstalled {
                    runtime: self.binaries.join("/"),
                }))
            }
        };
        let runtime = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name().to_string());

        let mut cmd = neuro_process::command_in_new_group(&binary);
        cmd.args(self.exec_args(&image, req));
        tracing::info!(job_id = %req.job_id, image = %image.display(), device = req.device.as_str(), threads = req.threads, "running segmentation via {}", runtime);
        progress(20, "Running brain segmentation (apptainer)");

        let launched = launch(&runtime, cmd, &self.registry, req.job_id, None).await?;
        let result = supervise(&runtime, launched, req, cancel).await;
        self.registry.unregister(&req.job_id).await;

        let finished = match result? {
            Ok(finished) => finished,
            Err(Stopped::TimedOut) => {
                return Err(RungError::TimedOut {
                    runtime,
                    after: req.timeout,
                })
            }
            Err(Stopped::Cancelled) => return Err(RungError::Cancelled),
        };
        if !finished.status.success() {
            return Err(RungError::Exit {
                runtime,
                code: finished.status.code(),
                stderr: finished.stderr_tail,
            });
        }
        let expected = req.seg_dir.join(req.job_id.to_string()).join(ASEG_STATS);
        if tokio::fs::metadata(&expected).await.is_err() {
            return Err(RungError::MissingOutput { runtime, expected });
        }
        Ok(req.seg_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Device;
    use neuro_types::JobId;
    use std::time::Duration;

    fn request(seg_dir: PathBuf) -> RunRequest {
        RunRequest {
            job_id: JobId::new(),
            input: PathBuf::from("/data/uploads/sub-01.mgz"),
            seg_dir,
            device: Device::Cpu,
            threads: 6,
            timeout: Duration::from_secs(5),
            kill_grace: Duration::from_millis(200),
        }
    }

    #[test]
    fn exec_args_bind_and_entrypoint() {
        let runtime = ApptainerRuntime::new(&InvokerSettings::default(), ProcessRegistry::new("/tmp"));
        let req = request(PathBuf::from("/data/outputs/j/fastsurfer"));
        let args = runtime.exec_args(Path::new("/images/fastsurfer.sif"), &req).join(" ");
        assert!(args.starts_with("exec --bind /data/uploads:/input:ro --bind /data/outputs/j/fastsurfer:/output"));
        assert!(!args.contains("--nv"));
        assert!(args.contains("--env TQDM_DISABLE=1 --cleanenv /images/fastsurfer.sif /fastsurfer/run_fastsurfer.sh --t1 /input/sub-01.mgz"));
        assert!(args.contains("--device cpu --batch 1 --threads 6"));
    }

    #[tokio::test]
    async fn missing_binary_or_image_is_unavailable() {
        let settings = InvokerSettings {
            sif_image: Some(PathBuf::from("/nonexistent/fastsurfer.sif")),
            sif_search_paths: vec![],
            ..Default::default()
        };
        let noop: &ProgressFn = &|_, _| {};
        let runtime = ApptainerRuntime::new(&settings, ProcessRegistry::new("/tmp"))
            .with_binaries(vec!["no-such-apptainer".into()]);
        assert!(matches!(
            runtime.probe(noop).await,
            Err(RuntimeUnavailable::NotInstalled { .. })
        ));

        let runtime = ApptainerRuntime::new(&settings, ProcessRegistry::new("/tmp"))
            .with_binaries(vec!["sh".into()]);
        assert!(matches!(
            runtime.probe(noop).await,
            Err(RuntimeUnavailable::ImageMissing { .. })
        ));

        // A binary outside the configured directories is not found.
        let elsewhere = tempfile::tempdir().unwrap();
        let runtime = ApptainerRuntime::new(&settings, ProcessRegistry::new("/tmp"))
            .with_binaries(vec!["sh".into()])
            .with_bin_dirs(vec![elsewhere.path().to_path_buf()]);
        assert!(matches!(
            runtime.probe(noop).await,
            Err(RuntimeUnavailable::NotInstalled { .. })
        ));
    }

    /// A fake runtime binary that sleeps forever; the run must time out and
    /// leave neither a live process nor a pid file behind.
    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_process_group() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let fake = bin_dir.join("fake-apptainer");
        std::fs::write(&fake, "#!/bin/sh\nsleep 30 &\nsleep 30\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        let sif = dir.path().join("fastsurfer.sif");
        std::fs::write(&sif, b"sif").unwrap();

        let registry = ProcessRegistry::new(dir.path().join("out"));
        let settings = InvokerSettings {
            sif_image: Some(sif),
            ..Default::default()
        };
        let runtime = ApptainerRuntime::new(&settings, registry.clone())
            .with_binaries(vec!["fake-apptainer".into()])
            .with_bin_dirs(vec![bin_dir]);
        let mut req = request(dir.path().join("out").join("fastsurfer"));
        req.timeout = Duration::from_millis(300);

        let noop: &ProgressFn = &|_, _| {};
        let err = runtime
            .run(&req, noop, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RungError::TimedOut { .. }));
        assert!(registry.lookup(&req.job_id).await.is_none());
    }
}
