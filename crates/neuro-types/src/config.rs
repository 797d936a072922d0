//! Process-wide settings, built once at startup and passed into constructors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What the invoker does when the segmentation tool hits its wall-clock timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Kill the tool and fall through to placeholder output; the job still completes.
    #[default]
    Placeholder,
    /// Kill the tool and fail the job.
    Fail,
}

impl FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "placeholder" | "mock" => Ok(TimeoutPolicy::Placeholder),
            "fail" => Ok(TimeoutPolicy::Fail),
            other => Err(format!("unknown timeout policy: {}", other)),
        }
    }
}

/// Which execution backend the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Durable SQLite-backed queue shared between worker processes.
    #[default]
    Queue,
    /// In-process worker pool.
    Direct,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Queue => "queue",
            BackendKind::Direct => "direct",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(BackendKind::Queue),
            "direct" | "local" | "threads" => Ok(BackendKind::Direct),
            other => Err(format!("unknown execution backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("/data/uploads"),
            output_dir: PathBuf::from("/data/outputs"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub job_db_path: PathBuf,
    pub queue_db_path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            job_db_path: PathBuf::from("/data/neuro-jobs.db"),
            queue_db_path: PathBuf::from("/data/neuro-queue.db"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokerSettings {
    /// Container image for the primary runtime.
    pub image: String,
    /// Explicit `.sif` image for the secondary runtime.
    pub sif_image: Option<PathBuf>,
    /// Searched in order when `sif_image` is unset.
    pub sif_search_paths: Vec<PathBuf>,
    pub processing_timeout: Duration,
    /// Wait between SIGTERM and SIGKILL on timeout.
    pub kill_grace: Duration,
    pub timeout_policy: TimeoutPolicy,
    /// Fall back to placeholder output when neither runtime is usable.
    pub placeholder_when_unavailable: bool,
    /// Skip both runtimes and write placeholder output.
    pub smoke_test: bool,
    pub host_upload_dir: Option<PathBuf>,
    pub host_output_dir: Option<PathBuf>,
    pub pull_missing_image: bool,
    pub pull_timeout: Duration,
    /// Run the container as root and pass `--allow_root`.
    pub force_root: bool,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            image: "deepmi/fastsurfer:latest".to_string(),
            sif_image: None,
            sif_search_paths: vec![
                PathBuf::from("/opt/containers/fastsurfer.sif"),
                PathBuf::from("/data/containers/fastsurfer.sif"),
                PathBuf::from("./containers/fastsurfer.sif"),
            ],
            processing_timeout: Duration::from_secs(36_000),
            kill_grace: Duration::from_secs(10),
            timeout_policy: TimeoutPolicy::Placeholder,
            placeholder_when_unavailable: true,
            smoke_test: false,
            host_upload_dir: None,
            host_output_dir: None,
            pull_missing_image: true,
            pull_timeout: Duration::from_secs(1_800),
            force_root: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    /// Worker tasks per process.
    pub workers: usize,
    /// Total attempts per queued task, the first one included.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Active tasks without a heartbeat for this long are handed to another worker.
    pub stale_after: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Queue,
            workers: 1,
            max_attempts: 5,
            retry_backoff: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Wait between SIGTERM and SIGKILL when cancelling.
    pub kill_grace: Duration,
    pub reap_interval: Duration,
    /// Name matched on process command lines by the sweep.
    pub tool_name: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(2),
            reap_interval: Duration::from_secs(300),
            tool_name: "fastsurfer".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// Also report hippocampal subfield volumes when the tool wrote them.
    pub include_subfields: bool,
    /// Asymmetry index magnitude above which a region is called lateralized.
    pub laterality_threshold: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            include_subfields: false,
            laterality_threshold: crate::metric::DEFAULT_LATERALITY_THRESHOLD,
        }
    }
}

/// Everything configurable, grouped per component.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub database: DatabaseSettings,
    pub invoker: InvokerSettings,
    pub backend: BackendSettings,
    pub lifecycle: LifecycleSettings,
    pub analysis: AnalysisSettings,
}

impl Settings {
    /// Read settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Settings::default();
        let storage = StorageSettings {
            upload_dir: env_path("UPLOAD_DIR").unwrap_or(d.storage.upload_dir),
            output_dir: env_path("OUTPUT_DIR").unwrap_or(d.storage.output_dir),
        };
        let database = DatabaseSettings {
            job_db_path: env_path("JOB_DB_PATH").unwrap_or(d.database.job_db_path),
            queue_db_path: env_path("QUEUE_DB_PATH").unwrap_or(d.database.queue_db_path),
        };
        let invoker = InvokerSettings {
            image: std::env::var("FASTSURFER_IMAGE").unwrap_or(d.invoker.image),
            sif_image: env_path("SINGULARITY_IMAGE_PATH"),
            sif_search_paths: d.invoker.sif_search_paths,
            processing_timeout: env_secs("PROCESSING_TIMEOUT", d.invoker.processing_timeout),
            kill_grace: env_secs("KILL_GRACE_SECS", d.invoker.kill_grace),
            timeout_policy: env_parse("TIMEOUT_POLICY", d.invoker.timeout_policy),
            placeholder_when_unavailable: env_flag(
                "PLACEHOLDER_WHEN_UNAVAILABLE",
                d.invoker.placeholder_when_unavailable,
            ),
            smoke_test: env_flag("FASTSURFER_SMOKE_TEST", d.invoker.smoke_test),
            host_upload_dir: env_path("HOST_UPLOAD_DIR"),
            host_output_dir: env_path("HOST_OUTPUT_DIR"),
            pull_missing_image: env_flag("FASTSURFER_PULL", d.invoker.pull_missing_image),
            pull_timeout: env_secs("FASTSURFER_PULL_TIMEOUT", d.invoker.pull_timeout),
            force_root: env_flag("FASTSURFER_FORCE_ROOT", d.invoker.force_root),
        };
        let backend = BackendSettings {
            kind: env_parse("EXECUTION_BACKEND", d.backend.kind),
            workers: env_parse::<usize>("MAX_CONCURRENT_JOBS", d.backend.workers).max(1),
            max_attempts: env_parse::<u32>("QUEUE_MAX_ATTEMPTS", d.backend.max_attempts).max(1),
            retry_backoff: env_secs("QUEUE_RETRY_BACKOFF_SECS", d.backend.retry_backoff),
            poll_interval: d.backend.poll_interval,
            heartbeat_interval: env_secs("QUEUE_HEARTBEAT_SECS", d.backend.heartbeat_interval),
            stale_after: env_secs("QUEUE_STALE_SECS", d.backend.stale_after),
        };
        let lifecycle = LifecycleSettings {
            kill_grace: env_secs("CANCEL_GRACE_SECS", d.lifecycle.kill_grace),
            reap_interval: env_secs("REAP_INTERVAL_SECS", d.lifecycle.reap_interval),
            tool_name: d.lifecycle.tool_name,
        };
        let analysis = AnalysisSettings {
            include_subfields: env_flag("INCLUDE_SUBFIELDS", d.analysis.include_subfields),
            laterality_threshold: env_parse("LATERALITY_THRESHOLD", d.analysis.laterality_threshold),
        };
        Self {
            storage,
            database,
            invoker,
            backend,
            lifecycle,
            analysis,
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, value = %raw, error = %e, "invalid setting, using default");
                default
            }
        },
        _ => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => parse_flag(&raw).unwrap_or_else(|| {
            tracing::warn!(key, value = %raw, "invalid flag, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
