//! SQLite-backed job store, shared between the API process and queue workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neuro_types::{
    Job, JobId, JobStatus, JobStep, JobStore, Metric, StatusChange, StepKind, StoreError,
};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const JOB_COLUMNS: &str = "id, filename, file_path, status, progress, current_step, \
    error_message, created_at, started_at, completed_at, result_path";

/// SQLite-backed job store for persistence.
pub struct SqliteJobStore {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteJobStore {
    /// Open (or create) the store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path).map_err(db)?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db)?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(db)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                file_path TEXT,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                current_step TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result_path TEXT
            );

            CREATE TABLE IF NOT EXISTS job_steps (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                at TEXT NOT NULL,
                progress INTEGER NOT NULL,
                message TEXT NOT NULL,
                kind TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS metrics (
                job_id TEXT NOT NULL,
                region TEXT NOT NULL,
                left_volume REAL NOT NULL,
                right_volume REAL NOT NULL,
                asymmetry_index REAL NOT NULL,
                PRIMARY KEY (job_id, region),
                FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_steps_job ON job_steps(job_id, seq);
            "#,
        )
        .map_err(db)?;

        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Other(format!("failed to acquire lock: {}", e)))?;
        f(&mut conn)
    }

    fn load_in(conn: &rusqlite::Connection, id: &JobId) -> Result<Option<Job>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id.to_string()],
            row_to_job,
        )
        .optional()
        .map_err(db)
    }

    fn insert_step(
        conn: &rusqlite::Connection,
        id: &JobId,
        step: &JobStep,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO job_steps (job_id, at, progress, message, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                step.at.to_rfc3339(),
                step.progress,
                step.message,
                step.kind.as_str()
            ],
        )
        .map_err(db)?;
        Ok(())
    }
}

fn db(e: rusqlite::Error) -> StoreError {
    StoreError::Other(e.to_string())
}

fn conversion<E>(col: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(col: usize, raw: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion(col, e))
    })
    .transpose()
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ColumnError(String);

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<Job, rusqlite::Error> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let progress: i64 = row.get(4)?;
    let created_at = parse_ts(7, Some(row.get(7)?))?.unwrap_or_else(Utc::now);
    Ok(Job {
        id: id.parse().map_err(|e| conversion(0, e))?,
        filename: row.get(1)?,
        file_path: row.get(2)?,
        status: status
            .parse()
            .map_err(|e: String| conversion(3, ColumnError(e)))?,
        progress: progress.clamp(0, 100) as u8,
        current_step: row.get(5)?,
        error_message: row.get(6)?,
        created_at,
        started_at: parse_ts(8, row.get(8)?)?,
        completed_at: parse_ts(9, row.get(9)?)?,
        result_path: row.get(10)?,
    })
}

fn write_job(conn: &rusqlite::Connection, job: &Job) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE jobs SET status = ?2, progress = ?3, current_step = ?4, error_message = ?5, \
         started_at = ?6, completed_at = ?7, result_path = ?8 WHERE id = ?1",
        params![
            job.id.to_string(),
            job.status.as_str(),
            job.progress,
            job.current_step,
            job.error_message,
            job.started_at.map(|t| t.to_rfc3339()),
            job.completed_at.map(|t| t.to_rfc3339()),
            job.result_path,
        ],
    )
    .map_err(db)?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    JOB_COLUMNS
                ),
                params![
                    job.id.to_string(),
                    job.filename,
                    job.file_path,
                    job.status.as_str(),
                    job.progress,
                    job.current_step,
                    job.error_message,
                    job.created_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.result_path,
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.with_conn(|conn| Self::load_in(conn, id))
    }

    async fn compare_and_swap_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        change: StatusChange,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            // IMMEDIATE takes the write lock up front so a concurrent process cannot
            // interleave between the read and the write.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let mut job = Self::load_in(&tx, id)?.ok_or(StoreError::NotFound(*id))?;
            if job.status != expected {
                return Ok(false);
            }
            job.apply(&change)?;
            write_job(&tx, &job)?;
            let step = JobStep {
                at: change.at,
                progress: job.progress,
                message: change
                    .step
                    .clone()
                    .unwrap_or_else(|| change.next.as_str().to_string()),
                kind: StepKind::Transition,
            };
            Self::insert_step(&tx, id, &step)?;
            tx.commit().map_err(db)?;
            Ok(true)
        })
    }

    async fn update_progress(
        &self,
        id: &JobId,
        percent: u8,
        step: &str,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let mut job = Self::load_in(&tx, id)?.ok_or(StoreError::NotFound(*id))?;
            if !job.advance_progress(percent, step) {
                return Ok(false);
            }
            write_job(&tx, &job)?;
            Self::insert_step(&tx, id, &JobStep::new(StepKind::Progress, job.progress, step))?;
            tx.commit().map_err(db)?;
            Ok(true)
        })
    }

    async fn record_step(&self, id: &JobId, step: JobStep) -> Result<(), StoreError> {
        self.with_conn(|conn| Self::insert_step(conn, id, &step))
    }

    async fn steps(&self, id: &JobId) -> Result<Vec<JobStep>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT at, progress, message, kind FROM job_steps WHERE job_id = ?1 ORDER BY seq",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![id.to_string()], |row| {
                    let at = parse_ts(0, Some(row.get(0)?))?.unwrap_or_else(Utc::now);
                    let progress: i64 = row.get(1)?;
                    let kind: String = row.get(3)?;
                    Ok(JobStep {
                        at,
                        progress: progress.clamp(0, 100) as u8,
                        message: row.get(2)?,
                        kind: kind
                            .parse::<StepKind>()
                            .map_err(|e| conversion(3, ColumnError(e)))?,
                    })
                })
                .map_err(db)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db)
        })
    }

    async fn replace_metrics(&self, id: &JobId, metrics: &[Metric]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(db)?;
            tx.execute("DELETE FROM metrics WHERE job_id = ?1", params![id.to_string()])
                .map_err(db)?;
            for m in metrics {
                tx.execute(
                    "INSERT OR REPLACE INTO metrics (job_id, region, left_volume, right_volume, asymmetry_index) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id.to_string(),
                        m.region,
                        m.left_volume,
                        m.right_volume,
                        m.asymmetry_index
                    ],
                )
                .map_err(db)?;
            }
            tx.commit().map_err(db)
        })
    }

    async fn metrics(&self, id: &JobId) -> Result<Vec<Metric>, StoreError> {
        let job_id = *id;
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT region, left_volume, right_volume, asymmetry_index FROM metrics \
                     WHERE job_id = ?1 ORDER BY rowid",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![job_id.to_string()], |row| {
                    Ok(Metric {
                        job_id,
                        region: row.get(0)?,
                        left_volume: row.get(1)?,
                        right_volume: row.get(2)?,
                        asymmetry_index: row.get(3)?,
                    })
                })
                .map_err(db)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db)
        })
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM jobs WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at",
                    JOB_COLUMNS
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], row_to_job)
                .map_err(db)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db)
        })
    }
}
