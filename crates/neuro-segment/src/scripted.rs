//! Scripted runtime for tests: behaves the way it is told, without spawning anything.

use crate::error::{RungError, RuntimeUnavailable};
use crate::placeholder::write_aseg_stats;
use crate::runtime::{ContainerRuntime, ProgressFn, RunRequest};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Scripted {
    /// Probe reports the runtime unusable.
    Unavailable(RuntimeUnavailable),
    /// Write real-looking stats with these hippocampus volumes.
    Succeed { left: f64, right: f64 },
    /// Exit non-zero with this stderr.
    Fail(String),
    /// Report a timeout immediately.
    TimeOut,
    /// Block until cancelled.
    Hang,
}

pub struct ScriptedRuntime {
    name: String,
    behavior: Scripted,
    progress: Vec<(u8, String)>,
    delay: Duration,
    runs: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(name: impl Into<String>, behavior: Scripted) -> Self {
        Self {
            name: name.into(),
            behavior,
            progress: Vec::new(),
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        }
    }

    /// Progress values reported during `run`, in order.
    pub fn with_progress(mut self, steps: impl IntoIterator<Item = (u8, &'static str)>) -> Self {
        self.progress = steps.into_iter().map(|(p, s)| (p, s.to_string())).collect();
        self
    }

    /// Sleep this long inside `run` before finishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `run` was called.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self, _progress: &ProgressFn) -> Result<(), RuntimeUnavailable> {
        match &self.behavior {
            Scripted::Unavailable(reason) => Err(reason.clone()),
            _ => Ok(()),
        }
    }

    async fn run(
        &self,
        req: &RunRequest,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RungError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for (pct, step) in &self.progress {
            progress(*pct, step);
        }
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(RungError::Cancelled),
            }
        }
        match &self.behavior {
            Scripted::Unavailable(reason) => Err(RungError::Unavailable(reason.clone())),
            Scripted::Succeed { left, right } => {
                write_aseg_stats(&req.seg_dir, &req.job_id, *left, *right)
                    .await
                    .map_err(|e| RungError::Io {
                        runtime: self.name.clone(),
                        source: e,
                    })?;
                Ok(req.seg_dir.clone())
            }
            Scripted::Fail(stderr) => Err(RungError::Exit {
                runtime: self.name.clone(),
                code: Some(1),
                stderr: stderr.clone(),
            }),
            Scripted::TimeOut => Err(RungError::TimedOut {
                runtime: self.name.clone(),
                after: req.timeout,
            }),
            Scripted::Hang => {
                cancel.cancelled().await;
                Err(RungError::Cancelled)
            }
        }
    }
}
