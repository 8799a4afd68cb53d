//! Backend-agnostic scheduling and lifecycle of delayed jobs.
//!
//! The scheduler owns the handler registry and drives every status change
//! through [`JobStore::transition`]. Execution is triggered either directly
//! via [`JobScheduler::process_job`] or by the due-job ticker.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::JobSchedulerConfig;
use crate::error::{Error, JobError, StoreError};
use crate::jobs::libsql_store::LibSqlJobStore;
use crate::jobs::memory::MemoryJobStore;
use crate::jobs::model::{
    Job, JobCounts, JobFilter, JobList, JobStatus, JobStatusReport, NewJob, QueueHealth,
    ScheduleOutcome,
};
use crate::jobs::store::{JobProvider, JobStore};

/// Due jobs picked up per tick.
const DUE_BATCH: usize = 100;

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), String>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), String> {
        (self.0)(job.clone()).await
    }
}

pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    config: JobSchedulerConfig,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, config: JobSchedulerConfig) -> Self {
        Self {
            store,
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the configured provider and open its store.
    pub async fn from_config(config: JobSchedulerConfig) -> Result<Self, Error> {
        let provider: JobProvider = config.provider.parse()?;
        let store: Arc<dyn JobStore> = match provider {
            JobProvider::Bull => Arc::new(MemoryJobStore::new()),
            JobProvider::Agenda => match &config.database_path {
                Some(path) => Arc::new(LibSqlJobStore::new_local(path).await?),
                None => Arc::new(LibSqlJobStore::new_memory().await?),
            },
        };
        info!(%provider, "Job scheduler initialized");
        Ok(Self::new(store, config))
    }

    pub fn provider(&self) -> JobProvider {
        self.store.provider()
    }

    /// Register (or replace) the handler for a job type.
    pub async fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        debug!(%job_type, "Job handler registered");
        self.handlers.write().await.insert(job_type, handler);
    }

    /// Schedule a job. Validation and storage failures are reported in the
    /// outcome rather than returned as errors.
    pub async fn schedule_job(
        &self,
        id: &str,
        scheduled_for: DateTime<Utc>,
        job_type: &str,
        data: serde_json::Value,
    ) -> ScheduleOutcome {
        if scheduled_for <= Utc::now() {
            return ScheduleOutcome::rejected(JobError::NotInFuture);
        }
        if job_type.trim().is_empty() {
            return ScheduleOutcome::rejected(JobError::TypeRequired);
        }

        let requested_id = if id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };

        let new = NewJob {
            requested_id: requested_id.clone(),
            job_type: job_type.to_string(),
            data,
            scheduled_for,
        };

        match self.store.insert(new).await {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    scheduled_for = %job.scheduled_for,
                    provider = %self.provider(),
                    "Job scheduled"
                );
                ScheduleOutcome::scheduled(job.id)
            }
            Err(StoreError::Conflict(_)) => {
                ScheduleOutcome::rejected(JobError::Duplicate { id: requested_id })
            }
            Err(e) => {
                error!(job_id = %requested_id, error = %e, "Failed to schedule job");
                ScheduleOutcome::rejected(e)
            }
        }
    }

    /// Cancel a job that has not started. The job is removed from the store.
    pub async fn cancel_job(&self, id: &str) -> Result<bool, JobError> {
        let Some(job) = self.store.get(id).await? else {
            return Ok(false);
        };
        if !job.status.can_transition_to(JobStatus::Cancelled) {
            debug!(job_id = %id, status = %job.status, "Job not cancellable");
            return Ok(false);
        }

        let removed = self.store.remove_if(id, JobStatus::Scheduled).await?;
        if removed {
            info!(job_id = %id, job_type = %job.job_type, "Job cancelled");
        }
        Ok(removed)
    }

    pub async fn get_job_status(&self, id: &str) -> Result<JobStatusReport, JobError> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(JobStatusReport::from)
            .unwrap_or_else(JobStatusReport::missing))
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<JobList, JobError> {
        let (jobs, total) = self.store.list(&filter.normalized()).await?;
        Ok(JobList { jobs, total })
    }

    /// Run a scheduled job through its handler to a terminal state.
    ///
    /// Returns `false` when the job is unknown or no longer `Scheduled`.
    pub async fn process_job(&self, id: &str) -> Result<bool, JobError> {
        let Some(job) = self
            .store
            .transition(id, JobStatus::Scheduled, JobStatus::Running, None)
            .await?
        else {
            debug!(job_id = %id, "Job not processable");
            return Ok(false);
        };

        let handler = self.handlers.read().await.get(&job.job_type).cloned();
        let result = match handler {
            Some(handler) => AssertUnwindSafe(handler.handle(&job))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err("job handler panicked".to_string())),
            None => Err(JobError::NoHandler {
                job_type: job.job_type.clone(),
            }
            .to_string()),
        };

        match result {
            Ok(()) => {
                self.store
                    .transition(id, JobStatus::Running, JobStatus::Completed, None)
                    .await?;
                info!(job_id = %id, job_type = %job.job_type, "Job completed");
            }
            Err(reason) => {
                self.store
                    .transition(id, JobStatus::Running, JobStatus::Failed, Some(&reason))
                    .await?;
                error!(job_id = %id, job_type = %job.job_type, error = %reason, "Job failed");
            }
        }
        Ok(true)
    }

    /// Process every job whose time has come. Returns how many were run.
    pub async fn run_due_jobs(&self) -> usize {
        let due = match self.store.due(Utc::now(), DUE_BATCH).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to load due jobs");
                return 0;
            }
        };

        let mut processed = 0;
        for id in due {
            match self.process_job(&id).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %id, error = %e, "Failed to process due job"),
            }
        }
        if processed > 0 {
            debug!(processed, "Due jobs processed");
        }
        processed
    }

    /// Remove completed/failed jobs older than `older_than_days`
    /// (config default when `None`). Store errors are logged and yield 0.
    pub async fn cleanup_jobs(&self, older_than_days: Option<u32>) -> usize {
        let days = older_than_days.unwrap_or(self.config.cleanup_after_days);
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));

        match self.store.purge_terminal_before(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, days, "Old jobs cleaned up");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, days, "Job cleanup failed");
                0
            }
        }
    }

    /// Backend reachability and per-status counts. Never errors.
    pub async fn queue_health(&self) -> QueueHealth {
        let provider = self.provider().to_string();
        let counts = match self.store.ping().await {
            Ok(()) => self.store.counts().await,
            Err(e) => Err(e),
        };

        match counts {
            Ok(job_counts) => QueueHealth {
                healthy: true,
                provider,
                job_counts,
            },
            Err(e) => {
                warn!(%provider, error = %e, "Job store health check failed");
                QueueHealth {
                    healthy: false,
                    provider,
                    job_counts: JobCounts::default(),
                }
            }
        }
    }
}

/// Spawn a background task that runs due jobs every `interval`.
pub fn spawn_due_job_ticker(
    scheduler: Arc<JobScheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            scheduler.run_due_jobs().await;
        }
    })
}

/// Spawn a background task that purges old terminal jobs every `interval`.
pub fn spawn_cleanup_ticker(
    scheduler: Arc<JobScheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            scheduler.cleanup_jobs(None).await;
        }
    })
}
