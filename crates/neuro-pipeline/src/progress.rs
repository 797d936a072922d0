//! Non-blocking progress persistence.
//!
//! Callers push updates into a bounded channel and never wait on the store;
//! a single writer task persists them in order. When the channel is full the
//! update is dropped. Invoker progress is throttled to 5-point steps, while
//! orchestrator milestones are always written.

use neuro_types::{JobId, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CAPACITY: usize = 64;
const THROTTLE: u8 = 5;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Update {
    percent: u8,
    step: String,
    milestone: bool,
}

/// Sending side. [`ProgressWriter::finish`] drains only once every clone is dropped.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    tx: mpsc::Sender<Update>,
}

pub(crate) struct ProgressWriter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Spawn the writer. `floor` is the job's persisted progress.
    pub fn spawn(store: Arc<dyn JobStore>, job_id: JobId, floor: u8) -> (Self, ProgressWriter) {
        let (tx, mut rx) = mpsc::channel::<Update>(CAPACITY);
        let handle = tokio::spawn(async move {
            let mut last = floor;
            while let Some(update) = rx.recv().await {
                if !should_persist(last, &update) {
                    continue;
                }
                match store.update_progress(&job_id, update.percent, &update.step).await {
                    Ok(true) => last = update.percent,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, percent = update.percent, error = %e, "progress update dropped")
                    }
                }
            }
        });
        (Self { tx }, ProgressWriter { handle })
    }

    fn push(&self, percent: u8, step: &str, milestone: bool) {
        let update = Update {
            percent: percent.min(100),
            step: step.to_string(),
            milestone,
        };
        if let Err(mpsc::error::TrySendError::Full(u)) = self.tx.try_send(update) {
            tracing::debug!(percent = u.percent, "progress channel full, update dropped");
        }
    }

    /// Orchestrator step; persisted whenever it does not move backwards.
    pub fn milestone(&self, percent: u8, step: &str) {
        tracing::info!(percent, step, "job progress");
        self.push(percent, step, true);
    }

    /// Advisory progress from the invoker.
    pub fn report(&self, percent: u8, step: &str) {
        tracing::debug!(percent, step, "invoker progress");
        self.push(percent, step, false);
    }
}

fn should_persist(last: u8, update: &Update) -> bool {
    if update.percent < last {
        return false;
    }
    update.milestone || update.percent >= 100 || update.percent >= last.saturating_add(THROTTLE)
}

impl ProgressWriter {
    /// Wait for queued updates to be written. Gives up after a bounded wait.
    pub async fn finish(self, reporter: ProgressReporter) {
        drop(reporter);
        let mut handle = self.handle;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!("progress writer did not drain in time");
            handle.abort();
        }
    }
}
