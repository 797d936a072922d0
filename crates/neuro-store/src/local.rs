//! Local-disk artifact storage.

use async_trait::async_trait;
use neuro_types::{ArtifactStorage, Job, StorageError, StorageSettings};
use std::path::{Path, PathBuf};

/// Inputs live under `upload_dir`, job outputs under `output_dir/<job_id>`.
#[derive(Debug, Clone)]
pub struct LocalArtifactStorage {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl LocalArtifactStorage {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_settings(settings: &StorageSettings) -> Self {
        Self::new(&settings.upload_dir, &settings.output_dir)
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait]
impl ArtifactStorage for LocalArtifactStorage {
    async fn resolve_input_path(&self, job: &Job) -> Result<PathBuf, StorageError> {
        let key = job.file_path.as_deref().unwrap_or(&job.filename);
        if key.is_empty() {
            return Err(StorageError::Other(format!("job {} has no input", job.id)));
        }
        let candidate = Path::new(key);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.upload_dir.join(candidate)
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(StorageError::Other(format!(
                "input is not a file: {}",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(job_id = %job.id, path = %path.display(), "input not visible yet");
                Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn persist_output(&self, job: &Job, output_dir: &Path) -> Result<String, StorageError> {
        let meta = tokio::fs::metadata(output_dir).await?;
        if !meta.is_dir() {
            return Err(StorageError::Other(format!(
                "output for job {} is not a directory: {}",
                job.id,
                output_dir.display()
            )));
        }
        Ok(output_dir.display().to_string())
    }
}
