use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dispatch_scheduler::config::{DispatchConfig, JobSchedulerConfig, TransportConfig};
use dispatch_scheduler::dispatch::{DispatchQueue, EnqueueOptions, Priority};
use dispatch_scheduler::health::HealthReporter;
use dispatch_scheduler::jobs::{self, Job, JobHandler, JobScheduler};
use dispatch_scheduler::transport::{OutboundEmail, build_deliverer};

/// How often the health snapshot is logged.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Cleanup runs far less often than due-job pickup.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on draining the queue at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Turns a reminder job's payload into a queued email.
struct ReminderHandler {
    queue: DispatchQueue<OutboundEmail>,
}

#[async_trait]
impl JobHandler for ReminderHandler {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        let email: OutboundEmail = serde_json::from_value(job.data.clone())
            .map_err(|e| format!("invalid reminder payload: {e}"))?;
        email.validate().map_err(|e| e.to_string())?;

        let item_id = self
            .queue
            .enqueue(email, EnqueueOptions::default().priority(Priority::High))
            .await;
        info!(job_id = %job.id, %item_id, "Reminder queued for delivery");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing; optional daily log file alongside stderr
    let (file_layer, _log_guard) = match std::env::var("DISPATCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let dispatch_config = DispatchConfig::from_env()?;
    let job_config = JobSchedulerConfig::from_env()?;
    let transport_config = TransportConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export EMAIL_FROM_ADDRESS=bookings@example.com");
        std::process::exit(1);
    });

    eprintln!("📬 Dispatch Scheduler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Transport: {}", transport_config.provider);
    eprintln!(
        "   Rate limit: {}/s, max retries: {}",
        dispatch_config.rate_limit_per_second, dispatch_config.max_retries
    );
    eprintln!("   Job provider: {}", job_config.provider);
    eprintln!("   Press Ctrl-C to stop.\n");

    // ── Dispatch queue ──────────────────────────────────────────────────
    let deliverer = build_deliverer(&transport_config)?;
    let queue = DispatchQueue::new(dispatch_config, deliverer);

    // ── Job scheduler ───────────────────────────────────────────────────
    let tick_interval = job_config.tick_interval;
    let scheduler = Arc::new(JobScheduler::from_config(job_config).await?);
    scheduler
        .register_handler(
            "booking_reminder",
            Arc::new(ReminderHandler {
                queue: queue.clone(),
            }),
        )
        .await;

    let due_ticker = jobs::spawn_due_job_ticker(Arc::clone(&scheduler), tick_interval);
    let cleanup_ticker = jobs::spawn_cleanup_ticker(Arc::clone(&scheduler), CLEANUP_INTERVAL);

    // ── Health ──────────────────────────────────────────────────────────
    let reporter = HealthReporter::new(queue.clone(), Arc::clone(&scheduler));
    let health_ticker = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
        loop {
            ticker.tick().await;
            let report = reporter.report().await;
            if report.healthy {
                info!(
                    queue_length = report.dispatch.queue_length,
                    delivered = report.dispatch.stats.delivered,
                    failed = report.dispatch.stats.failed,
                    scheduled_jobs = report.jobs.job_counts.scheduled,
                    "Subsystem healthy"
                );
            } else {
                warn!(
                    dispatch_healthy = report.dispatch.healthy,
                    jobs_healthy = report.jobs.healthy,
                    "Subsystem degraded"
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining dispatch queue");

    due_ticker.abort();
    cleanup_ticker.abort();
    health_ticker.abort();

    let pending = queue.status().await.queue_length;
    if pending > 0 {
        info!(pending, "Waiting for pending deliveries");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, queue.wait_idle())
        .await
        .is_err()
    {
        let dropped = queue.clear().await;
        warn!(dropped, "Shutdown grace period elapsed, dropping pending deliveries");
    }
    info!(stats = ?queue.stats(), "Dispatch queue stopped");

    Ok(())
}
