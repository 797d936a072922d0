//! Segmentation invoker: runs the external tool once, degrading through a
//! ladder of container runtimes down to placeholder output.

mod apptainer;
mod docker;
mod error;
mod exec;
mod gpu;
mod host_paths;
mod invoker;
mod placeholder;
mod runtime;

#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

pub use apptainer::ApptainerRuntime;
pub use docker::DockerRuntime;
pub use error::{InvokeError, RungError, RuntimeUnavailable};
pub use gpu::{detect_gpu, thread_count, Device};
pub use host_paths::HostPaths;
pub use invoker::{Invocation, OutputSource, Rung, SegmentationInvoker};
pub use placeholder::{placeholder_reason, write_aseg_stats, write_placeholder, PLACEHOLDER_MARKER};
pub use runtime::{ContainerRuntime, ProgressFn, RunRequest, RungOutcome};

#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptedRuntime, Scripted};

/// Aseg statistics file the extractor reads, relative to `<seg_dir>/<job_id>/`.
pub const ASEG_STATS: &str = "stats/aseg+DKT.stats";

/// Input suffixes the tool accepts.
pub const SUPPORTED_SUFFIXES: [&str; 3] = [".nii.gz", ".nii", ".mgz"];
