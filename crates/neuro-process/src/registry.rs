//! Live segmentation processes, by job.

use crate::ProcessError;
use chrono::{DateTime, Utc};
use neuro_types::JobId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Name of the per-job record file under `<output_root>/<job_id>/`.
pub const PID_FILE_NAME: &str = ".process_pid";

/// What was launched for a job, recorded before the launcher blocks on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub job_id: JobId,
    pub pid: u32,
    /// Process group; equal to `pid` when spawned via `command_in_new_group`.
    #[serde(default)]
    pub pgid: Option<i32>,
    /// Name of the container the runtime was asked to create, if any.
    #[serde(default)]
    pub container_name: Option<String>,
    /// Runtime binary that owns the process ("docker", "apptainer", ...).
    pub runtime: String,
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(job_id: JobId, pid: u32, runtime: impl Into<String>) -> Self {
        Self {
            job_id,
            pid,
            pgid: None,
            container_name: None,
            runtime: runtime.into(),
            started_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, pgid: i32) -> Self {
        self.pgid = Some(pgid);
        self
    }

    pub fn with_container(mut self, name: impl Into<String>) -> Self {
        self.container_name = Some(name.into());
        self
    }
}

/// Process records kept in memory and mirrored to a pid file per job, so the
/// API process can find what a queue worker launched.
#[derive(Clone)]
pub struct ProcessRegistry {
    output_root: PathBuf,
    records: Arc<RwLock<HashMap<JobId, ProcessRecord>>>,
}

impl ProcessRegistry {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn pid_file(&self, job_id: &JobId) -> PathBuf {
        self.output_root.join(job_id.to_string()).join(PID_FILE_NAME)
    }

    /// Record a launched process. The in-memory entry always lands; a pid file
    /// write failure is returned so the caller can log it.
    pub async fn register(&self, record: ProcessRecord) -> Result<(), ProcessError> {
        let path = self.pid_file(&record.job_id);
        self.records
            .write()
            .await
            .insert(record.job_id, record.clone());
        tracing::debug!(job_id = %record.job_id, pid = record.pid, pgid = ?record.pgid, "registered process");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body =
            serde_json::to_vec_pretty(&record).map_err(|e| ProcessError::PidFile(e.to_string()))?;
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    /// Forget the job's process and remove its pid file.
    pub async fn unregister(&self, job_id: &JobId) {
        self.records.write().await.remove(job_id);
        match tokio::fs::remove_file(self.pid_file(job_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "failed to remove pid file"),
        }
    }

    /// In-memory record first, then the pid file.
    pub async fn lookup(&self, job_id: &JobId) -> Option<ProcessRecord> {
        if let Some(record) = self.records.read().await.get(job_id) {
            return Some(record.clone());
        }
        let path = self.pid_file(job_id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "failed to read pid file");
                return None;
            }
        };
        match serde_json::from_slice::<ProcessRecord>(&body) {
            Ok(record) if record.job_id == *job_id => Some(record),
            Ok(_) => {
                tracing::warn!(job_id = %job_id, path = %path.display(), "pid file belongs to another job");
                None
            }
            Err(_) => legacy_pid(&body).map(|pid| {
                ProcessRecord::new(*job_id, pid, "unknown").with_group(pid as i32)
            }),
        }
    }
}

/// Bare-integer pid files written by older launchers.
fn legacy_pid(body: &[u8]) -> Option<u32> {
    std::str::from_utf8(body).ok()?.trim().parse().ok()
}
