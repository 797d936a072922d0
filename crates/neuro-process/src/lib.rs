//! OS-process side of job cancellation.
//!
//! Segmentation runs are spawned in their own process group and recorded here
//! (in memory and as a `.process_pid` file next to the job output) before the
//! caller blocks on them, so a cancellation from any process can find and kill
//! the whole tree. The command-line sweep is the last resort when no record
//! exists.

mod group;
mod registry;
mod sweep;

pub use group::{
    command_in_new_group, is_alive, own_process_group, signal_group, signal_pid, terminate_group,
    Signal, TerminateOutcome,
};
pub use registry::{ProcessRecord, ProcessRegistry, PID_FILE_NAME};
pub use sweep::{MatchReason, MatchedProcess, ProcessSweeper, SweepReport, ToolProcess};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("permission denied signalling pid {0}")]
    PermissionDenied(u32),
    #[error("no such process: {0}")]
    NotFound(u32),
    #[error("pid file: {0}")]
    PidFile(String),
    #[error("process io: {0}")]
    Io(#[from] std::io::Error),
}
