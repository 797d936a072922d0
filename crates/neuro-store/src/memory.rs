//! In-memory job store.

use async_trait::async_trait;
use neuro_types::{
    Job, JobId, JobStatus, JobStep, JobStore, Metric, StatusChange, StepKind, StoreError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Entry {
    job: Option<Job>,
    steps: Vec<JobStep>,
    metrics: Vec<Metric>,
}

/// In-memory implementation of JobStore. One lock guards each job's record,
/// trail and metrics together so a compare-and-swap is a single critical section.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    entries: Arc<RwLock<HashMap<JobId, Entry>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(job.id).or_default();
        if entry.job.is_some() {
            return Err(StoreError::Other(format!("job already exists: {}", job.id)));
        }
        entry.job = Some(job.clone());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let guard = self.entries.read().await;
        Ok(guard.get(id).and_then(|e| e.job.clone()))
    }

    async fn compare_and_swap_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        change: StatusChange,
    ) -> Result<bool, StoreError> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        let job = entry.job.as_mut().ok_or(StoreError::NotFound(*id))?;
        if job.status != expected {
            return Ok(false);
        }
        job.apply(&change)?;
        let message = change
            .step
            .clone()
            .unwrap_or_else(|| change.next.as_str().to_string());
        let progress = job.progress;
        entry.steps.push(JobStep {
            at: change.at,
            progress,
            message,
            kind: StepKind::Transition,
        });
        Ok(true)
    }

    async fn update_progress(
        &self,
        id: &JobId,
        percent: u8,
        step: &str,
    ) -> Result<bool, StoreError> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        let job = entry.job.as_mut().ok_or(StoreError::NotFound(*id))?;
        if !job.advance_progress(percent, step) {
            return Ok(false);
        }
        let progress = job.progress;
        entry
            .steps
            .push(JobStep::new(StepKind::Progress, progress, step));
        Ok(true)
    }

    async fn record_step(&self, id: &JobId, step: JobStep) -> Result<(), StoreError> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        entry.steps.push(step);
        Ok(())
    }

    async fn steps(&self, id: &JobId) -> Result<Vec<JobStep>, StoreError> {
        let guard = self.entries.read().await;
        Ok(guard.get(id).map(|e| e.steps.clone()).unwrap_or_default())
    }

    async fn replace_metrics(&self, id: &JobId, metrics: &[Metric]) -> Result<(), StoreError> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        entry.metrics = metrics.to_vec();
        Ok(())
    }

    async fn metrics(&self, id: &JobId) -> Result<Vec<Metric>, StoreError> {
        let guard = self.entries.read().await;
        Ok(guard.get(id).map(|e| e.metrics.clone()).unwrap_or_default())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let guard = self.entries.read().await;
        let mut jobs: Vec<Job> = guard
            .values()
            .filter_map(|e| e.job.clone())
            .filter(|j| status.map_or(true, |s| j.status == s))
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
