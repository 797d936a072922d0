//! Container-relative to host-visible path translation.
//!
//! When the worker itself runs in a container and starts the tool through the
//! host's container engine, bind mounts are resolved on the host. Paths under
//! the worker's own upload/output mounts have to be rewritten to the host
//! directories backing them.

use neuro_types::{InvokerSettings, StorageSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ContainerInfo {
    #[serde(rename = "Mounts", default)]
    mounts: Vec<Mount>,
}

#[derive(Debug, Deserialize)]
struct Mount {
    #[serde(rename = "Source", default)]
    source: String,
    #[serde(rename = "Destination", default)]
    destination: String,
}

/// Local directory roots and the host directories they map to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    local_upload: PathBuf,
    local_output: PathBuf,
    host_upload: PathBuf,
    host_output: PathBuf,
}

impl HostPaths {
    /// No translation: the worker sees the same paths as the host.
    pub fn identity(storage: &StorageSettings) -> Self {
        Self {
            local_upload: storage.upload_dir.clone(),
            local_output: storage.output_dir.clone(),
            host_upload: storage.upload_dir.clone(),
            host_output: storage.output_dir.clone(),
        }
    }

    /// Explicit settings first, then our own container's mounts, then identity.
    pub async fn resolve(storage: &StorageSettings, invoker: &InvokerSettings) -> Self {
        let mut paths = Self::identity(storage);
        let mut upload = invoker.host_upload_dir.clone();
        let mut output = invoker.host_output_dir.clone();

        if upload.is_none() || output.is_none() {
            match inspect_own_mounts().await {
                Some(mounts) => {
                    let (u, o) = paths.from_mounts(&mounts);
                    upload = upload.or(u);
                    output = output.or(o);
                    tracing::info!(upload = ?upload, output = ?output, "detected host paths from container mounts");
                }
                None => tracing::debug!("not running in an inspectable container, using local paths"),
            }
        }
        if let Some(u) = upload {
            paths.host_upload = u;
        }
        if let Some(o) = output {
            paths.host_output = o;
        }
        paths
    }

    fn from_mounts(&self, mounts: &[Mount]) -> (Option<PathBuf>, Option<PathBuf>) {
        let find = |dest: &Path| {
            mounts
                .iter()
                .find(|m| Path::new(&m.destination) == dest && !m.source.is_empty())
                .map(|m| PathBuf::from(&m.source))
        };
        (find(&self.local_upload), find(&self.local_output))
    }

    /// Host-visible form of a local path. Paths outside both roots are returned unchanged.
    pub fn translate(&self, local: &Path) -> PathBuf {
        if let Ok(rel) = local.strip_prefix(&self.local_output) {
            return self.host_output.join(rel);
        }
        if let Ok(rel) = local.strip_prefix(&self.local_upload) {
            return self.host_upload.join(rel);
        }
        local.to_path_buf()
    }
}

/// `docker inspect <hostname>` of the container we run in, if any.
async fn inspect_own_mounts() -> Option<Vec<Mount>> {
    if tokio::fs::metadata("/.dockerenv").await.is_err() {
        return None;
    }
    let hostname = match std::env::var("HOSTNAME") {
        Ok(h) if !h.is_empty() => h,
        _ => tokio::fs::read_to_string("/etc/hostname")
            .await
            .ok()?
            .trim()
            .to_string(),
    };
    let output = tokio::process::Command::new("docker")
        .args(["inspect", &hostname])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(INSPECT_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => out,
        Ok(Ok(out)) => {
            tracing::warn!(code = ?out.status.code(), "docker inspect failed");
            return None;
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "docker inspect could not run");
            return None;
        }
        Err(_) => {
            tracing::warn!("docker inspect timed out");
            return None;
        }
    };
    parse_inspect(&output.stdout)
}

fn parse_inspect(body: &[u8]) -> Option<Vec<Mount>> {
    match serde_json::from_slice::<Vec<ContainerInfo>>(body) {
        Ok(infos) => infos.into_iter().next().map(|i| i.mounts),
        Err(e) => {
            tracing::warn!(error = %e, "unparseable docker inspect output");
            None
        }
    }
}
