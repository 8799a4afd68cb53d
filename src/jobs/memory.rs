//! In-memory job store (`bull` provider).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::jobs::model::{Job, JobCounts, JobFilter, JobStatus, NewJob};
use crate::jobs::store::{JobProvider, JobStore};

/// Delay-queue style store held entirely in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed job, bypassing validation. Used to seed state.
    pub async fn put(&self, job: Job) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn provider(&self) -> JobProvider {
        JobProvider::Bull
    }

    async fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&new.requested_id) {
            return Err(StoreError::Conflict(format!(
                "job {} already exists",
                new.requested_id
            )));
        }
        let job = Job::new(new.requested_id, new.job_type, new.data, new.scheduled_for);
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if job.status != from || job.transition_to(to).is_err() {
            return Ok(None);
        }
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        Ok(Some(job.clone()))
    }

    async fn remove_if(&self, id: &str, status: JobStatus) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(id) {
            Some(job) if job.status == status => {
                jobs.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let total = matching.len();
        Ok((filter.paginate(matching), total))
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<&Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Scheduled && j.scheduled_for <= now)
            .collect();
        due.sort_by_key(|j| j.scheduled_for);
        Ok(due.into_iter().take(limit).map(|j| j.id.clone()).collect())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(matches!(j.status, JobStatus::Completed | JobStatus::Failed) && j.updated_at < cutoff)
        });
        Ok(before - jobs.len())
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let jobs = self.jobs.read().await;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(id: &str, job_type: &str) -> NewJob {
        NewJob {
            requested_id: id.into(),
            job_type: job_type.into(),
            data: serde_json::json!({ "id": id }),
            scheduled_for: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn keeps_caller_id_and_rejects_duplicates() {
        let store = MemoryJobStore::new();
        let job = store.insert(new_job("j1", "reminder")).await.unwrap();
        assert_eq!(job.id, "j1");
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(store.insert(new_job("j1", "reminder")).await.is_err());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemoryJobStore::new();
        store.insert(new_job("j1", "reminder")).await.unwrap();

        let running = store
            .transition("j1", JobStatus::Scheduled, JobStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(running.unwrap().status, JobStatus::Running);

        // Second claim loses.
        assert!(
            store
                .transition("j1", JobStatus::Scheduled, JobStatus::Running, None)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .transition("missing", JobStatus::Scheduled, JobStatus::Running, None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn purge_only_touches_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let old = Utc::now() - chrono::Duration::days(10);

        let mut done = Job::new("done", "t", serde_json::Value::Null, old);
        done.status = JobStatus::Completed;
        done.updated_at = old;
        store.put(done).await;

        let mut waiting = Job::new("waiting", "t", serde_json::Value::Null, old);
        waiting.updated_at = old;
        store.put(waiting).await;

        let removed = store
            .purge_terminal_before(Utc::now() - chrono::Duration::days(5))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("done").await.unwrap().is_none());
        assert!(store.get("waiting").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn counts_by_status() {
        let store = MemoryJobStore::new();
        store.insert(new_job("a", "t")).await.unwrap();
        store.insert(new_job("b", "t")).await.unwrap();
        store
            .transition("b", JobStatus::Scheduled, JobStatus::Running, None)
            .await
            .unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 2);
    }
}
