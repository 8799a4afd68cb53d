//! Job types and the job state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Lifecycle state of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its scheduled time.
    Scheduled,
    /// Handler is executing.
    Running,
    /// Handler finished successfully.
    Completed,
    /// Handler returned an error.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Scheduled, Running) | (Scheduled, Cancelled) |
            (Running, Completed) | (Running, Failed)
        )
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" | "delayed" => Ok(Self::Scheduled),
            "running" | "active" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(JobError::UnknownStatus(other.to_string())),
        }
    }
}

/// A delayed job owned by a job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Canonical id within the store.
    pub id: String,
    /// Caller-supplied id when the store generates its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        job_type: impl Into<String>,
        data: serde_json::Value,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            reference: None,
            job_type: job_type.into(),
            data,
            scheduled_for,
            status: JobStatus::Scheduled,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Move to `target`, refreshing `updated_at`.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A validated job waiting to be written to a store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub requested_id: String,
    pub job_type: String,
    pub data: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
}

/// Filter and pagination for listing jobs. `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    /// Build from raw query values; empty strings mean "no filter".
    pub fn from_query(
        status: Option<&str>,
        job_type: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Self, JobError> {
        let status = match status.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse()?),
            None => None,
        };
        Ok(Self {
            status,
            job_type: job_type.map(str::to_string),
            limit,
            offset,
        }
        .normalized())
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Drop empty-string type filters.
    pub fn normalized(mut self) -> Self {
        if self.job_type.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.job_type = None;
        }
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.job_type.as_deref().is_none_or(|t| t == job.job_type)
    }

    /// Apply offset/limit to an already filtered, ordered list.
    pub fn paginate(&self, jobs: Vec<Job>) -> Vec<Job> {
        jobs.into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Result of `list_jobs`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
    /// Matching jobs before pagination.
    pub total: usize,
}

/// Result of `schedule_job`. Validation failures are reported here, not raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScheduleOutcome {
    pub fn scheduled(job_id: impl Into<String>) -> Self {
        Self {
            success: true,
            job_id: Some(job_id.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            job_id: None,
            error: Some(error.to_string()),
        }
    }
}

/// Result of `get_job_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JobStatusReport {
    pub fn missing() -> Self {
        Self {
            exists: false,
            status: None,
            scheduled_for: None,
            data: None,
        }
    }
}

impl From<Job> for JobStatusReport {
    fn from(job: Job) -> Self {
        Self {
            exists: true,
            status: Some(job.status),
            scheduled_for: Some(job.scheduled_for),
            data: Some(job.data),
        }
    }
}

/// Number of stored jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub scheduled: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Scheduled => &mut self.scheduled,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        self.scheduled + self.running + self.completed + self.failed + self.cancelled
    }
}

/// Result of `queue_health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub healthy: bool,
    pub provider: String,
    pub job_counts: JobCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobStatus::Scheduled.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for target in JobStatus::ALL {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_parse_accepts_queue_aliases() {
        assert_eq!("delayed".parse::<JobStatus>().unwrap(), JobStatus::Scheduled);
        assert_eq!("Active".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!(matches!(
            "exploded".parse::<JobStatus>(),
            Err(JobError::UnknownStatus(s)) if s == "exploded"
        ));
    }

    #[test]
    fn job_transition_updates_timestamp() {
        let mut job = Job::new("j1", "reminder", serde_json::json!({}), Utc::now());
        let before = job.updated_at;
        job.transition_to(JobStatus::Running).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.updated_at >= before);
        assert!(job.transition_to(JobStatus::Cancelled).is_err());
    }

    #[test]
    fn filter_treats_empty_strings_as_unset() {
        let filter = JobFilter::from_query(Some(""), Some("  "), None, None).unwrap();
        assert_eq!(filter, JobFilter::default());
    }

    #[test]
    fn filter_matches_and_paginates() {
        let now = Utc::now();
        let jobs: Vec<Job> = (0..5)
            .map(|i| Job::new(format!("j{i}"), if i % 2 == 0 { "a" } else { "b" }, serde_json::Value::Null, now))
            .collect();
        let filter = JobFilter::default().with_type("a").with_offset(1).with_limit(1);
        let matching: Vec<Job> = jobs.into_iter().filter(|j| filter.matches(j)).collect();
        assert_eq!(matching.len(), 3);
        let page = filter.paginate(matching);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "j2");
    }

    #[test]
    fn status_report_serializes_camel_case() {
        let json = serde_json::to_value(JobStatusReport::missing()).unwrap();
        assert_eq!(json, serde_json::json!({ "exists": false }));
    }
}
