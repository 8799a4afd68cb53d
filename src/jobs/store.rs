//! Backend-agnostic job store trait and provider selection.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ConfigError, StoreError};
use crate::jobs::model::{Job, JobCounts, JobFilter, JobStatus, NewJob};

/// Job store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProvider {
    /// In-memory delay queue. Keeps the caller-supplied id.
    Bull,
    /// Persisted libSQL store. Generates its own ids.
    Agenda,
}

impl FromStr for JobProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bull" => Ok(Self::Bull),
            "agenda" => Ok(Self::Agenda),
            other => Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for JobProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "bull"),
            Self::Agenda => write!(f, "agenda"),
        }
    }
}

/// Persistence for delayed jobs.
///
/// Every status change goes through [`JobStore::transition`], which only
/// succeeds when the job is still in the expected state, so two callers can
/// never both claim the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    fn provider(&self) -> JobProvider;

    /// Store a new job and return it with its canonical id.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Move `id` from `from` to `to`. Returns the updated job, or `None` when
    /// the job is missing or no longer in `from`.
    async fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<Option<Job>, StoreError>;

    /// Delete `id` only if it is currently in `status`.
    async fn remove_if(&self, id: &str, status: JobStatus) -> Result<bool, StoreError>;

    /// Matching jobs ordered by `scheduled_for`, paginated, plus the unpaginated count.
    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError>;

    /// Ids of `Scheduled` jobs due at or before `now`, oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Delete completed/failed jobs last updated before `cutoff`.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn counts(&self) -> Result<JobCounts, StoreError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;
}
