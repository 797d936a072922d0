use std::path::PathBuf;
use std::time::Duration;

/// Why a container runtime cannot be used at all. Each kind tells the operator
/// something different to fix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeUnavailable {
    #[error("{runtime} is not installed; install it or enable another runtime")]
    NotInstalled { runtime: String },
    #[error("{runtime} is installed but not running; start the {runtime} daemon")]
    NotRunning { runtime: String },
    #[error("segmentation image {image} is not available to {runtime}: {detail}")]
    ImageMissing {
        runtime: String,
        image: String,
        detail: String,
    },
}

/// A rung that was usable but did not produce output.
#[derive(Debug, thiserror::Error)]
pub enum RungError {
    /// Discovered only once the run started (e.g. the daemon went away).
    #[error(transparent)]
    Unavailable(RuntimeUnavailable),
    #[error("{runtime} timed out after {}s", after.as_secs())]
    TimedOut { runtime: String, after: Duration },
    #[error("cancelled")]
    Cancelled,
    #[error("{runtime} exited with {code:?}: {stderr}")]
    Exit {
        runtime: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{runtime} finished without writing {}", expected.display())]
    MissingOutput { runtime: String, expected: PathBuf },
    #[error("{runtime}: {source}")]
    Io {
        runtime: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("unsupported input format: {} (expected .nii, .nii.gz or .mgz)", .0.display())]
    UnsupportedInput(PathBuf),
    #[error("input not found: {}", .0.display())]
    InputMissing(PathBuf),
    /// No rung succeeded and placeholder output is disabled; carries the primary's reason.
    #[error(transparent)]
    Unavailable(RuntimeUnavailable),
    #[error("segmentation failed on every runtime: {0}")]
    Exhausted(String),
    #[error("segmentation timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("segmentation cancelled")]
    Cancelled,
    /// The placeholder rung itself could not write its output.
    #[error("placeholder output could not be written: {0}")]
    Placeholder(#[source] std::io::Error),
    #[error("output directory: {0}")]
    Io(#[from] std::io::Error),
}
