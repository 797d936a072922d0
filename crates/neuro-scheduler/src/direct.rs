//! In-process backend: a fixed pool of tokio workers fed by a channel.
//!
//! No retry: a failed run is final for that submission. Handles live in memory
//! only and are lost when the process restarts.

use crate::trait_::{Abandonment, BackendError, ExecutionBackend, JobRunner, RunContext, TaskHandle};
use async_trait::async_trait;
use neuro_types::{BackendKind, JobId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

struct Slot {
    handle: TaskHandle,
    seq: u64,
    started: bool,
    cancel: CancellationToken,
}

type Slots = Arc<Mutex<HashMap<JobId, Slot>>>;

pub struct DirectBackend {
    slots: Slots,
    tx: mpsc::UnboundedSender<(JobId, u64)>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl DirectBackend {
    /// Spawn `workers` worker tasks (at least one) on the current runtime.
    pub fn new(runner: Arc<dyn JobRunner>, workers: usize) -> Self {
        let slots: Slots = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel::<(JobId, u64)>();
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        for worker in 0..workers.max(1) {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&rx),
                Arc::clone(&slots),
                Arc::clone(&runner),
                shutdown.clone(),
            ));
        }

        Self {
            slots,
            tx,
            next_seq: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Stop taking new work. Running jobs are not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<(JobId, u64)>>>,
    slots: Slots,
    runner: Arc<dyn JobRunner>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some((job_id, seq)) = next else { break };

        let ctx = {
            let mut guard = slots.lock().await;
            match guard.get_mut(&job_id) {
                Some(slot) if slot.seq == seq && !slot.cancel.is_cancelled() => {
                    slot.started = true;
                    RunContext {
                        cancel: slot.cancel.clone(),
                        ..RunContext::single()
                    }
                }
                _ => {
                    tracing::debug!(worker, job_id = %job_id, "task revoked before start");
                    continue;
                }
            }
        };

        tracing::info!(worker, job_id = %job_id, "direct worker picked up job");
        // Own task per run: a panicking run must not take the worker or its slot with it.
        let run = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.run(&job_id, &ctx).await }
        });
        match run.await {
            Ok(Ok(outcome)) => tracing::info!(worker, job_id = %job_id, ?outcome, "job run finished"),
            Ok(Err(e)) => tracing::error!(worker, job_id = %job_id, error = %e, "job run failed"),
            Err(e) => {
                tracing::error!(worker, job_id = %job_id, error = %e, "job run aborted");
                let how = Abandonment::Failed(format!("job run aborted: {}", e));
                if let Err(e) = runner.abandon(&job_id, &how).await {
                    tracing::error!(worker, job_id = %job_id, error = %e, "failed to settle aborted job");
                }
            }
        }

        let mut guard = slots.lock().await;
        if guard.get(&job_id).map(|s| s.seq) == Some(seq) {
            guard.remove(&job_id);
        }
    }
    tracing::debug!(worker, "direct worker stopped");
}

#[async_trait]
impl ExecutionBackend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn submit(&self, job_id: &JobId) -> Result<TaskHandle, BackendError> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::Closed);
        }
        let mut guard = self.slots.lock().await;
        if guard.contains_key(job_id) {
            return Err(BackendError::AlreadySubmitted(*job_id));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let handle = TaskHandle {
            backend: BackendKind::Direct,
            job_id: *job_id,
            task_id: seq.to_string(),
        };
        guard.insert(
            *job_id,
            Slot {
                handle: handle.clone(),
                seq,
                started: false,
                cancel: CancellationToken::new(),
            },
        );
        if self.tx.send((*job_id, seq)).is_err() {
            guard.remove(job_id);
            return Err(BackendError::Closed);
        }
        tracing::info!(job_id = %job_id, task = %handle, "job submitted to direct backend");
        Ok(handle)
    }

    async fn cancel(&self, handle: &TaskHandle, force: bool) -> Result<bool, BackendError> {
        let mut guard = self.slots.lock().await;
        let Some(slot) = guard.get(&handle.job_id) else {
            return Ok(false);
        };
        if slot.handle != *handle {
            return Ok(false);
        }
        if !slot.started {
            slot.cancel.cancel();
            guard.remove(&handle.job_id);
            tracing::info!(job_id = %handle.job_id, "revoked queued task");
            return Ok(true);
        }
        if force {
            slot.cancel.cancel();
            tracing::info!(job_id = %handle.job_id, "interrupting running task");
            return Ok(true);
        }
        Ok(false)
    }

    async fn find(&self, job_id: &JobId) -> Result<Option<TaskHandle>, BackendError> {
        Ok(self.slots.lock().await.get(job_id).map(|s| s.handle.clone()))
    }
}
