//! Execution backends behind one submit / cancel / find contract, and the
//! lifecycle manager that cancels a job's task and OS processes together.

mod direct;
mod lifecycle;
mod trait_;

#[cfg(feature = "sqlite")]
mod queue;

pub use direct::DirectBackend;
pub use lifecycle::{ProcessLifecycleManager, ReapReport};
pub use trait_::{Abandonment, BackendError, ExecutionBackend, JobRunner, RunContext, TaskHandle};

#[cfg(feature = "sqlite")]
pub use queue::{spawn_workers, Abandoned, Claimed, QueueBackend, QueueWorker, TaskInfo};
