//! Job orchestration: the runner the execution backends call, and the
//! create / submit / cancel surface used by the upload layer.

mod control;
mod orchestrator;
mod progress;
mod results;

pub use control::{Cancellation, ControlError, JobControl};
pub use orchestrator::{Orchestrator, RegenerateError};
pub use results::RESULTS_FILE;
