//! Aggregate health of the dispatch queue and job scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::dispatch::{DispatchQueue, DispatchStats};
use crate::jobs::{JobScheduler, QueueHealth};

/// Liveness of the dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchHealth {
    pub healthy: bool,
    pub queue_length: usize,
    pub ready: usize,
    pub delayed: usize,
    pub processing: bool,
    pub last_progress: Option<DateTime<Utc>>,
    pub stats: DispatchStats,
}

/// Combined report for both halves of the subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsystemHealth {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub dispatch: DispatchHealth,
    pub jobs: QueueHealth,
}

pub struct HealthReporter<P> {
    queue: DispatchQueue<P>,
    scheduler: Arc<JobScheduler>,
}

impl<P> HealthReporter<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(queue: DispatchQueue<P>, scheduler: Arc<JobScheduler>) -> Self {
        Self { queue, scheduler }
    }

    /// Snapshot both components. Never fails; problems show up as
    /// `healthy = false`.
    pub async fn report(&self) -> SubsystemHealth {
        let status = self.queue.status().await;
        if status.stalled {
            warn!(
                queue_length = status.queue_length,
                processing = status.processing,
                last_progress = ?status.last_progress,
                "Dispatch queue has pending items but is not making progress"
            );
        }

        let dispatch = DispatchHealth {
            healthy: !status.stalled,
            queue_length: status.queue_length,
            ready: status.ready,
            delayed: status.delayed,
            processing: status.processing,
            last_progress: status.last_progress,
            stats: status.stats,
        };
        let jobs = self.scheduler.queue_health().await;

        SubsystemHealth {
            healthy: dispatch.healthy && jobs.healthy,
            checked_at: Utc::now(),
            dispatch,
            jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::config::{DispatchConfig, JobSchedulerConfig};
    use crate::error::DeliveryError;
    use crate::jobs::MemoryJobStore;
    use crate::transport::Deliverer;

    struct Sink;

    #[async_trait]
    impl Deliverer<String> for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        async fn deliver(&self, _payload: &String) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn idle_subsystem_is_healthy() {
        let queue = DispatchQueue::<String>::new(DispatchConfig::default(), Arc::new(Sink));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::new(MemoryJobStore::new()),
            JobSchedulerConfig::default(),
        ));
        let reporter = HealthReporter::new(queue, scheduler);

        let report = reporter.report().await;
        assert!(report.healthy);
        assert_eq!(report.dispatch.queue_length, 0);
        assert!(!report.dispatch.processing);
        assert_eq!(report.jobs.provider, "bull");
        assert_eq!(report.jobs.job_counts.total(), 0);
    }

    #[tokio::test]
    async fn report_serializes_camel_case() {
        let queue = DispatchQueue::<String>::new(DispatchConfig::default(), Arc::new(Sink));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::new(MemoryJobStore::new()),
            JobSchedulerConfig::default(),
        ));
        let report = HealthReporter::new(queue, scheduler).report().await;

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("checkedAt").is_some());
        assert_eq!(json["dispatch"]["queueLength"], 0);
        assert_eq!(json["jobs"]["jobCounts"]["scheduled"], 0);
    }
}
