//! Job record, status state machine, and the step trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Message stored on every job that ends in CANCELLED.
pub const CANCELLED_MESSAGE: &str = "Job cancelled by user";

/// Opaque, immutable job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First hyphen-separated group of the id, as it shows up in truncated command lines.
    pub fn short(&self) -> String {
        let s = self.0.to_string();
        s.split('-').next().unwrap_or_default().to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Job status. Serialized as lowercase strings on every external boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// COMPLETED, FAILED and CANCELLED are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Waiting to start or currently processing.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Legal edges: PENDING -> RUNNING | CANCELLED, RUNNING -> any terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Original upload filename.
    pub filename: String,
    /// Storage key or path of the uploaded input.
    #[serde(default)]
    pub file_path: Option<String>,
    pub status: JobStatus,
    /// 0-100, monotonically non-decreasing while RUNNING.
    pub progress: u8,
    /// Observability only; never used for control decisions.
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_path: Option<String>,
}

impl Job {
    /// New PENDING job.
    pub fn new(filename: impl Into<String>, file_path: Option<String>) -> Self {
        Self {
            id: JobId::new(),
            filename: filename.into(),
            file_path,
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_path: None,
        }
    }

    /// Processing duration in seconds, 0 until both timestamps exist.
    pub fn duration_seconds(&self) -> f64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Apply a status change to this record.
    ///
    /// The caller is responsible for the compare half of compare-and-swap; this
    /// only enforces edge legality and the per-field rules (timestamps set once,
    /// progress forced to 100 on COMPLETED, error message only on FAILED/CANCELLED).
    pub fn apply(&mut self, change: &StatusChange) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(change.next) {
            return Err(InvalidTransition {
                from: self.status,
                to: change.next,
            });
        }
        match change.next {
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(change.at);
                }
            }
            JobStatus::Completed => {
                self.progress = 100;
                self.result_path = change.result_path.clone();
                self.error_message = None;
                self.completed_at.get_or_insert(change.at);
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                self.error_message = change.error_message.clone();
                self.completed_at.get_or_insert(change.at);
            }
            JobStatus::Pending => {}
        }
        if let Some(ref step) = change.step {
            self.current_step = Some(step.clone());
        }
        self.status = change.next;
        Ok(())
    }

    /// Advance progress while RUNNING. Returns false (and changes nothing) when the
    /// job is not running or the value would move backwards.
    pub fn advance_progress(&mut self, percent: u8, step: &str) -> bool {
        let percent = percent.min(100);
        if self.status != JobStatus::Running || percent < self.progress {
            return false;
        }
        self.progress = percent;
        self.current_step = Some(step.to_string());
        true
    }
}

/// Rejected edge in the status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Target status plus the fields written with it, in one atomic write.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub next: JobStatus,
    pub at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub result_path: Option<String>,
    pub step: Option<String>,
}

impl StatusChange {
    fn to(next: JobStatus) -> Self {
        Self {
            next,
            at: Utc::now(),
            error_message: None,
            result_path: None,
            step: None,
        }
    }

    pub fn start() -> Self {
        Self::to(JobStatus::Running).with_step("Job started")
    }

    pub fn complete(result_path: impl Into<String>) -> Self {
        let mut change = Self::to(JobStatus::Completed).with_step("Complete");
        change.result_path = Some(result_path.into());
        change
    }

    pub fn fail(message: impl Into<String>) -> Self {
        let mut change = Self::to(JobStatus::Failed).with_step("Failed");
        change.error_message = Some(message.into());
        change
    }

    pub fn cancel() -> Self {
        let mut change = Self::to(JobStatus::Cancelled).with_step("Cancelled");
        change.error_message = Some(CANCELLED_MESSAGE.to_string());
        change
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// Kind of entry in a job's step trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Progress,
    Transition,
    /// Synthetic placeholder output was used instead of real segmentation.
    Placeholder,
    Note,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Progress => "progress",
            StepKind::Transition => "transition",
            StepKind::Placeholder => "placeholder",
            StepKind::Note => "note",
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(StepKind::Progress),
            "transition" => Ok(StepKind::Transition),
            "placeholder" => Ok(StepKind::Placeholder),
            "note" => Ok(StepKind::Note),
            other => Err(format!("unknown step kind: {}", other)),
        }
    }
}

/// One entry of the observability trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
    pub at: DateTime<Utc>,
    pub progress: u8,
    pub message: String,
    pub kind: StepKind,
}

impl JobStep {
    pub fn new(kind: StepKind, progress: u8, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            progress,
            message: message.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn completion_forces_progress_and_sets_timestamps_once() {
        let mut job = Job::new("scan.nii.gz", Some("scan.nii.gz".into()));
        job.apply(&StatusChange::start()).unwrap();
        let started = job.started_at;
        assert!(started.is_some());
        assert!(job.advance_progress(40, "segmenting"));
        assert!(!job.advance_progress(30, "stale"));
        assert_eq!(job.progress, 40);

        job.apply(&StatusChange::complete("/data/outputs/x")).unwrap();
        assert_eq!(job.progress, 100);
        assert_eq!(job.started_at, started);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());
        assert!(job.apply(&StatusChange::fail("late")).is_err());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn cancel_from_pending_never_starts() {
        let mut job = Job::new("scan.nii", None);
        job.apply(&StatusChange::cancel()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert_eq!(job.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(!job.advance_progress(50, "ignored"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
    }
}
