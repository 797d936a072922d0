//! Container runtime abstraction: one rung of the fallback ladder.

use crate::error::{RungError, RuntimeUnavailable};
use crate::gpu::Device;
use async_trait::async_trait;
use neuro_types::JobId;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Progress callback: `(percent, step description)`. Values are advisory.
pub type ProgressFn = dyn Fn(u8, &str) + Send + Sync;

/// Everything a runtime needs to run the tool once.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job_id: JobId,
    /// Local path of the input image.
    pub input: PathBuf,
    /// Subjects directory; the tool writes `<seg_dir>/<job_id>/...`.
    pub seg_dir: PathBuf,
    pub device: Device,
    pub threads: usize,
    pub timeout: Duration,
    /// Wait between SIGTERM and SIGKILL when the run is stopped.
    pub kill_grace: Duration,
}

impl RunRequest {
    /// File name of the input as seen inside the container at `/input`.
    pub fn input_name(&self) -> String {
        self.input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Tool arguments after the image/entrypoint.
    pub fn tool_args(&self) -> Vec<String> {
        vec![
            "--t1".into(),
            format!("/input/{}", self.input_name()),
            "--sid".into(),
            self.job_id.to_string(),
            "--sd".into(),
            "/output".into(),
            "--seg_only".into(),
            "--device".into(),
            self.device.as_str().into(),
            "--batch".into(),
            "1".into(),
            "--threads".into(),
            self.threads.to_string(),
            "--viewagg_device".into(),
            "cpu".into(),
        ]
    }
}

/// Result of one rung, matched on explicitly by the ladder.
#[derive(Debug)]
pub enum RungOutcome {
    /// The subjects directory holding real output.
    Success(PathBuf),
    Unavailable(RuntimeUnavailable),
    Failed(RungError),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name for logs and the step trail.
    fn name(&self) -> &str;

    /// Check the runtime is installed, running and has the image (pulling it if allowed).
    async fn probe(&self, progress: &ProgressFn) -> Result<(), RuntimeUnavailable>;

    /// Run the tool to completion. Must record the launched process with the
    /// registry before waiting on it, and stop it on timeout or cancellation.
    async fn run(
        &self,
        req: &RunRequest,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RungError>;
}
