//! Durable queue backend on a shared SQLite file.
//!
//! Any number of worker processes open the same database and claim tasks in
//! an IMMEDIATE transaction. Active tasks carry a heartbeat; a task whose
//! heartbeat goes stale is handed out again, so delivery is at-least-once.

use crate::trait_::{Abandonment, BackendError, ExecutionBackend, JobRunner, RunContext, TaskHandle};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use neuro_types::{BackendKind, BackendSettings, JobId, RunError};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SCHEDULED: &str = "scheduled";
const ACTIVE: &str = "active";
const REVOKED: &str = "revoked";
const SUCCEEDED: &str = "succeeded";
const FAILED: &str = "failed";
const HEARTBEAT_LOST: &str = "worker heartbeat lost";

fn ts(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now() -> String {
    ts(Utc::now())
}

fn after(delay: Duration) -> String {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    ts(Utc::now() + delay)
}

fn before(age: Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
    ts(Utc::now() - age)
}

fn db(e: rusqlite::Error) -> BackendError {
    BackendError::Other(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// A task handed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed {
    pub task_id: i64,
    pub job_id: JobId,
    /// 1-based, counting this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Queue row as shown by admin tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: i64,
    pub job_id: JobId,
    pub state: String,
    pub attempts: u32,
    pub worker: Option<String>,
    pub last_error: Option<String>,
}

/// A task the stale-claim recovery gave up on, whose job still has to be settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abandoned {
    pub task_id: i64,
    pub job_id: JobId,
    pub how: Abandonment,
}

#[derive(Clone)]
pub struct QueueBackend {
    conn: Arc<std::sync::Mutex<rusqlite::Connection>>,
    settings: BackendSettings,
}

impl QueueBackend {
    /// Open (or create) the queue database at `path`.
    pub fn new(path: impl AsRef<Path>, settings: BackendSettings) -> Result<Self, BackendError> {
        let conn = rusqlite::Connection::open(path).map_err(db)?;
        Self::init(conn, settings)
    }

    pub fn open_in_memory(settings: BackendSettings) -> Result<Self, BackendError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db)?;
        Self::init(conn, settings)
    }

    fn init(conn: rusqlite::Connection, settings: BackendSettings) -> Result<Self, BackendError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(db)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS tasks (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                run_after TEXT NOT NULL,
                worker TEXT,
                heartbeat_at TEXT,
                terminate INTEGER NOT NULL DEFAULT 0,
                unsettled INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_job
                ON tasks(job_id) WHERE state IN ('scheduled', 'active');
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(state, run_after);
            CREATE INDEX IF NOT EXISTS idx_tasks_unsettled ON tasks(unsettled) WHERE unsettled = 1;
            "#,
        )
        .map_err(db)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
            settings,
        })
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, BackendError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| BackendError::Other(format!("failed to acquire lock: {}", e)))?;
        f(&mut conn)
    }

    fn handle(job_id: JobId, task_id: i64) -> TaskHandle {
        TaskHandle {
            backend: BackendKind::Queue,
            job_id,
            task_id: task_id.to_string(),
        }
    }

    /// Put active tasks with a stale heartbeat back in the queue. Tasks asked to
    /// terminate are revoked instead, and tasks out of attempts are failed; both
    /// are flagged unsettled until their job is settled (see [`Self::abandoned`]).
    fn requeue_stale_in(&self, conn: &rusqlite::Connection) -> Result<usize, BackendError> {
        let changed = conn
            .execute(
                "UPDATE tasks SET \
                   state = CASE WHEN terminate = 1 THEN 'revoked' \
                                WHEN attempts >= max_attempts THEN 'failed' \
                                ELSE 'scheduled' END, \
                   unsettled = CASE WHEN terminate = 1 OR attempts >= max_attempts THEN 1 ELSE 0 END, \
                   last_error = ?3, worker = NULL, updated_at = ?1 \
                 WHERE state = 'active' AND heartbeat_at < ?2",
                params![now(), before(self.settings.stale_after), HEARTBEAT_LOST],
            )
            .map_err(db)?;
        if changed > 0 {
            tracing::warn!(count = changed, "recovered stale queue tasks");
        }
        Ok(changed)
    }

    pub fn requeue_stale(&self) -> Result<usize, BackendError> {
        self.with_conn(|conn| self.requeue_stale_in(conn))
    }

    /// Claim the oldest due task for `worker`.
    pub fn claim(&self, worker: &str) -> Result<Option<Claimed>, BackendError> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            self.requeue_stale_in(&tx)?;
            let at = now();
            let row = tx
                .query_row(
                    "SELECT task_id, job_id, attempts, max_attempts FROM tasks \
                     WHERE state = 'scheduled' AND run_after <= ?1 \
                     ORDER BY run_after, task_id LIMIT 1",
                    params![at],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, u32>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(db)?;
            let Some((task_id, job_id, attempts, max_attempts)) = row else {
                // Keep the stale-claim recovery even when there is nothing to claim.
                tx.commit().map_err(db)?;
                return Ok(None);
            };
            tx.execute(
                "UPDATE tasks SET state = 'active', attempts = attempts + 1, worker = ?2, \
                 heartbeat_at = ?3, updated_at = ?3 WHERE task_id = ?1",
                params![task_id, worker, at],
            )
            .map_err(db)?;
            tx.commit().map_err(db)?;
            let job_id = job_id
                .parse()
                .map_err(|e| BackendError::Other(format!("task {} has bad job id: {}", task_id, e)))?;
            Ok(Some(Claimed {
                task_id,
                job_id,
                attempt: attempts + 1,
                max_attempts,
            }))
        })
    }

    /// Refresh the claim. Returns true when the task was asked to terminate.
    pub fn heartbeat(&self, task_id: i64, worker: &str) -> Result<bool, BackendError> {
        self.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE tasks SET heartbeat_at = ?3 \
                     WHERE task_id = ?1 AND state = 'active' AND worker = ?2",
                    params![task_id, worker, now()],
                )
                .map_err(db)?;
            if updated == 0 {
                tracing::warn!(task_id, worker, "heartbeat for a task this worker no longer holds");
            }
            let terminate: Option<bool> = conn
                .query_row(
                    "SELECT terminate FROM tasks WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            Ok(terminate.unwrap_or(false))
        })
    }

    fn finish(&self, task_id: i64, state: &str, error: Option<&str>) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET state = ?2, last_error = ?3, worker = NULL, updated_at = ?4 \
                 WHERE task_id = ?1 AND state = 'active'",
                params![task_id, state, error, now()],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn retry_later(&self, task_id: i64, error: &str, delay: Duration) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET \
                   state = CASE WHEN terminate = 1 THEN 'revoked' ELSE 'scheduled' END, \
                   run_after = ?3, last_error = ?2, worker = NULL, updated_at = ?4 \
                 WHERE task_id = ?1 AND state = 'active'",
                params![task_id, error, after(delay), now()],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    /// Tasks given up by the stale-claim recovery whose job is not settled yet.
    pub fn abandoned(&self) -> Result<Vec<Abandoned>, BackendError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT task_id, job_id, state, last_error FROM tasks \
                     WHERE unsettled = 1 ORDER BY task_id",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })
                .map_err(db)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db)?;
            Ok(rows)
        })?;
        let mut abandoned = Vec::with_capacity(rows.len());
        for (task_id, job_id, state, last_error) in rows {
            let job_id = job_id
                .parse()
                .map_err(|e| BackendError::Other(format!("task {} has bad job id: {}", task_id, e)))?;
            let how = if state == REVOKED {
                Abandonment::Revoked
            } else {
                Abandonment::Failed(last_error.unwrap_or_else(|| HEARTBEAT_LOST.to_string()))
            };
            abandoned.push(Abandoned { task_id, job_id, how });
        }
        Ok(abandoned)
    }

    /// Clear the unsettled flag once the task's job has been settled.
    pub fn mark_settled(&self, task_id: i64) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET unsettled = 0, updated_at = ?2 WHERE task_id = ?1",
                params![task_id, now()],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    /// Most recent task row of the job, whatever its state.
    pub fn describe(&self, job_id: &JobId) -> Result<Option<TaskInfo>, BackendError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT task_id, job_id, state, attempts, worker, last_error FROM tasks \
                 WHERE job_id = ?1 ORDER BY task_id DESC LIMIT 1",
                params![job_id.to_string()],
                |row| {
                    Ok(TaskInfo {
                        task_id: row.get(0)?,
                        job_id: *job_id,
                        state: row.get(2)?,
                        attempts: row.get(3)?,
                        worker: row.get(4)?,
                        last_error: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(db)
        })
    }
}

#[async_trait]
impl ExecutionBackend for QueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Queue
    }

    async fn submit(&self, job_id: &JobId) -> Result<TaskHandle, BackendError> {
        let task_id = self.with_conn(|conn| {
            let at = now();
            conn.execute(
                "INSERT INTO tasks (job_id, state, max_attempts, run_after, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
                params![job_id.to_string(), SCHEDULED, self.settings.max_attempts.max(1), at],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    BackendError::AlreadySubmitted(*job_id)
                } else {
                    db(e)
                }
            })?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::info!(job_id = %job_id, task_id, "job queued");
        Ok(Self::handle(*job_id, task_id))
    }

    async fn cancel(&self, handle: &TaskHandle, force: bool) -> Result<bool, BackendError> {
        let task_id: i64 = handle
            .task_id
            .parse()
            .map_err(|_| BackendError::BadHandle(handle.to_string()))?;
        let delivered = self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let state: Option<String> = tx
                .query_row(
                    "SELECT state FROM tasks WHERE task_id = ?1 AND job_id = ?2",
                    params![task_id, handle.job_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            let delivered = match state.as_deref() {
                Some(SCHEDULED) => {
                    tx.execute(
                        "UPDATE tasks SET state = ?2, updated_at = ?3 WHERE task_id = ?1",
                        params![task_id, REVOKED, now()],
                    )
                    .map_err(db)?;
                    true
                }
                Some(ACTIVE) if force => {
                    tx.execute(
                        "UPDATE tasks SET terminate = 1, updated_at = ?2 WHERE task_id = ?1",
                        params![task_id, now()],
                    )
                    .map_err(db)?;
                    true
                }
                _ => false,
            };
            tx.commit().map_err(db)?;
            Ok(delivered)
        })?;
        tracing::info!(job_id = %handle.job_id, task_id, force, delivered, "queue cancel");
        Ok(delivered)
    }

    async fn find(&self, job_id: &JobId) -> Result<Option<TaskHandle>, BackendError> {
        let task_id: Option<i64> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT task_id FROM tasks WHERE job_id = ?1 AND state IN ('scheduled', 'active')",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)
        })?;
        Ok(task_id.map(|id| Self::handle(*job_id, id)))
    }
}

/// Pulls tasks from a [`QueueBackend`] and hands them to a runner.
pub struct QueueWorker {
    queue: QueueBackend,
    runner: Arc<dyn JobRunner>,
    name: String,
}

impl QueueWorker {
    pub fn new(queue: QueueBackend, runner: Arc<dyn JobRunner>, name: impl Into<String>) -> Self {
        Self {
            queue,
            runner,
            name: name.into(),
        }
    }

    /// Claim and run tasks until `shutdown` fires. A run in progress is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(worker = %self.name, "queue worker started");
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(worker = %self.name, error = %e, "queue poll failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.queue.settings.poll_interval) => {}
            }
        }
        tracing::info!(worker = %self.name, "queue worker stopped");
    }

    /// Run at most one due task. Returns whether a task was claimed.
    pub async fn run_once(&self) -> Result<bool, BackendError> {
        let claimed = self.queue.claim(&self.name)?;
        self.settle_abandoned().await;
        let Some(claimed) = claimed else {
            return Ok(false);
        };
        self.process(claimed).await;
        Ok(true)
    }

    /// Hand tasks abandoned by dead workers to the runner so their jobs leave
    /// RUNNING. Returns how many were settled; failures stay flagged for the
    /// next pass.
    pub async fn settle_abandoned(&self) -> usize {
        let abandoned = match self.queue.abandoned() {
            Ok(abandoned) => abandoned,
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "failed to list abandoned tasks");
                return 0;
            }
        };
        let mut settled = 0;
        for task in abandoned {
            if let Err(e) = self.runner.abandon(&task.job_id, &task.how).await {
                tracing::warn!(job_id = %task.job_id, task_id = task.task_id, error = %e, "failed to settle abandoned job");
                continue;
            }
            match self.queue.mark_settled(task.task_id) {
                Ok(()) => {
                    tracing::warn!(job_id = %task.job_id, task_id = task.task_id, how = ?task.how, "settled abandoned task");
                    settled += 1;
                }
                Err(e) => tracing::warn!(task_id = task.task_id, error = %e, "failed to mark task settled"),
            }
        }
        settled
    }

    async fn process(&self, claimed: Claimed) {
        let Claimed {
            task_id,
            job_id,
            attempt,
            max_attempts,
        } = claimed;
        tracing::info!(worker = %self.name, job_id = %job_id, task_id, attempt, max_attempts, "claimed task");

        let cancel = CancellationToken::new();
        let ctx = RunContext {
            attempt,
            max_attempts,
            cancel: cancel.clone(),
        };
        let beat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            task_id,
            self.name.clone(),
            cancel,
        ));
        let result = self.runner.run(&job_id, &ctx).await;
        beat.abort();

        let recorded = match &result {
            Ok(outcome) => {
                tracing::info!(job_id = %job_id, task_id, ?outcome, "task finished");
                self.queue.finish(task_id, SUCCEEDED, None)
            }
            Err(e) if retry_allowed(e) && attempt < max_attempts => {
                let backoff = self.queue.settings.retry_backoff;
                tracing::warn!(job_id = %job_id, task_id, attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "task will be retried");
                self.queue.retry_later(task_id, &e.to_string(), backoff)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, task_id, attempt, error = %e, "task failed");
                self.queue.finish(task_id, FAILED, Some(&e.to_string()))
            }
        };
        if let Err(e) = recorded {
            tracing::error!(job_id = %job_id, task_id, error = %e, "failed to record task result; heartbeat recovery will redeliver");
        }
    }
}

/// Transient errors are retried; so is a store outage, which leaves the job claimable.
fn retry_allowed(e: &RunError) -> bool {
    e.is_retryable() || matches!(e, RunError::Persistence(_))
}

async fn heartbeat_loop(queue: QueueBackend, task_id: i64, worker: String, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(queue.settings.heartbeat_interval);
    interval.tick().await;
    loop {
        interval.tick().await;
        match queue.heartbeat(task_id, &worker) {
            Ok(true) => {
                tracing::info!(task_id, "terminate requested, interrupting run");
                cancel.cancel();
                return;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(task_id, error = %e, "heartbeat failed"),
        }
    }
}

/// Spawn `count` workers (at least one) sharing one queue connection.
pub fn spawn_workers(
    queue: &QueueBackend,
    runner: Arc<dyn JobRunner>,
    count: usize,
    prefix: &str,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|n| {
            let worker = QueueWorker::new(queue.clone(), Arc::clone(&runner), format!("{}-{}", prefix, n));
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}
