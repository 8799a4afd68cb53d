//! Priority-ordered, time-gated pending deliveries with a single
//! processing loop.
//!
//! Pending items live in two ordered maps:
//! - `ready` keyed by `(priority, seq)`: dispatch order for eligible items
//! - `delayed` keyed by `(scheduled_for, seq)`: items waiting for their time
//!
//! Due delayed items are promoted into `ready` on every poll and keep their
//! original insertion sequence, so equal-priority items stay FIFO.
//!
//! The loop stamps `last_progress` each time it asks for work. A queue with
//! pending items whose loop task has exited, or whose stamp is older than
//! `STALL_POLLS` poll intervals plus one rate-limit interval, is reported as
//! stalled. The next `enqueue` replaces an exited loop task.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::item::{EnqueueOptions, Priority, QueuedItem};
use crate::dispatch::rate_limit::RateLimiter;
use crate::dispatch::retry::{RetryDecision, RetryPolicy};
use crate::error::DeliveryError;
use crate::transport::Deliverer;

/// Poll intervals without progress before a busy queue counts as stalled.
const STALL_POLLS: u32 = 5;
/// Lower bound on the loop's idle wait.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Whether a processing loop currently exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running,
}

/// What the loop should do next.
enum Next<P> {
    Dispatch(QueuedItem<P>),
    WaitUntil(DateTime<Utc>),
    Drained,
}

struct QueueState<P> {
    ready: BTreeMap<(Priority, u64), QueuedItem<P>>,
    delayed: BTreeMap<(DateTime<Utc>, u64), QueuedItem<P>>,
    next_seq: u64,
    loop_state: LoopState,
    loop_task: Option<JoinHandle<()>>,
    last_progress: Option<DateTime<Utc>>,
}

impl<P> QueueState<P> {
    fn new() -> Self {
        Self {
            ready: BTreeMap::new(),
            delayed: BTreeMap::new(),
            next_seq: 0,
            loop_state: LoopState::Idle,
            loop_task: None,
            last_progress: None,
        }
    }

    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// Insert as a fresh arrival (new sequence number).
    fn insert(&mut self, item: QueuedItem<P>, now: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        match item.scheduled_for {
            Some(at) if at > now => {
                self.delayed.insert((at, seq), item);
            }
            _ => {
                self.ready.insert((item.priority, seq), item);
            }
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), item) = entry.remove_entry();
            self.ready.insert((item.priority, seq), item);
        }
    }

    /// Pop the next ready item. Marks the loop idle when nothing is left.
    fn next(&mut self, now: DateTime<Utc>) -> Next<P> {
        self.last_progress = Some(now);
        self.promote_due(now);
        if let Some((_, item)) = self.ready.pop_first() {
            return Next::Dispatch(item);
        }
        if let Some(((at, _), _)) = self.delayed.first_key_value() {
            return Next::WaitUntil(*at);
        }
        self.loop_state = LoopState::Idle;
        Next::Drained
    }

    /// A loop is marked running and its task is still alive.
    fn loop_alive(&self) -> bool {
        self.loop_state == LoopState::Running
            && self
                .loop_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Lifetime delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    /// Items dropped after exhausting their retry budget.
    pub failed: u64,
}

/// Snapshot returned by [`DispatchQueue::status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub ready: usize,
    pub delayed: usize,
    pub processing: bool,
    /// Pending items with no live loop, or no progress within the stall window.
    pub stalled: bool,
    /// Last time the loop asked for work.
    pub last_progress: Option<DateTime<Utc>>,
    pub config: DispatchConfig,
    pub stats: DispatchStats,
}

struct QueueInner<P> {
    config: DispatchConfig,
    deliverer: Arc<dyn Deliverer<P>>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    state: Mutex<QueueState<P>>,
    /// Wakes a polling loop early when new work arrives.
    wake: Notify,
    /// Signalled when the loop drains and exits.
    drained: Notify,
    counters: Counters,
}

/// Outbound dispatch queue. Cheap to clone; clones share one queue.
pub struct DispatchQueue<P> {
    inner: Arc<QueueInner<P>>,
}

impl<P> Clone for DispatchQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> DispatchQueue<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(config: DispatchConfig, deliverer: Arc<dyn Deliverer<P>>) -> Self {
        let retry = RetryPolicy::from_config(&config);
        let limiter = RateLimiter::new(config.rate_limit_per_second);
        Self {
            inner: Arc::new(QueueInner {
                config,
                deliverer,
                retry,
                limiter,
                state: Mutex::new(QueueState::new()),
                wake: Notify::new(),
                drained: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Add a delivery to the queue and make sure the loop is running.
    pub async fn enqueue(&self, payload: P, options: EnqueueOptions) -> Uuid {
        let item = QueuedItem::new(payload, options, self.inner.config.max_retries);
        let id = item.id;
        let priority = item.priority;
        let scheduled_for = item.scheduled_for;

        let started = {
            let mut state = self.inner.state.lock().await;
            let now = Utc::now();
            state.insert(item, now);
            debug!(
                item_id = %id,
                %priority,
                scheduled_for = ?scheduled_for,
                queue_length = state.len(),
                "Item enqueued"
            );
            if state.loop_alive() {
                false
            } else {
                if state.loop_state == LoopState::Running {
                    warn!(
                        queue_length = state.len(),
                        "Dispatch loop exited unexpectedly, restarting"
                    );
                }
                state.loop_state = LoopState::Running;
                state.last_progress = Some(now);
                state.loop_task = Some(tokio::spawn(run_loop(Arc::clone(&self.inner))));
                true
            }
        };
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        if !started {
            self.inner.wake.notify_one();
        }

        id
    }

    /// Current queue length, loop state, configuration and counters.
    pub async fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        let stalled = state.len() > 0 && (!state.loop_alive() || self.progress_overdue(&state));
        QueueStatus {
            queue_length: state.len(),
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            processing: state.loop_state == LoopState::Running,
            stalled,
            last_progress: state.last_progress,
            config: self.inner.config.clone(),
            stats: self.stats(),
        }
    }

    fn progress_overdue(&self, state: &QueueState<P>) -> bool {
        let window = self
            .inner
            .config
            .poll_interval
            .max(MIN_POLL_INTERVAL)
            .saturating_mul(STALL_POLLS)
            .saturating_add(self.inner.limiter.min_interval());
        state.last_progress.is_some_and(|at| {
            (Utc::now() - at).to_std().unwrap_or(Duration::ZERO) > window
        })
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.inner.counters;
        DispatchStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Drop every pending item. Deliveries already in flight are unaffected.
    pub async fn clear(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let removed = state.len();
        state.ready.clear();
        state.delayed.clear();
        drop(state);

        self.inner.wake.notify_one();
        info!(removed, "Dispatch queue cleared");
        removed
    }

    /// Resolve once the queue is empty and no loop is running.
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.inner.drained.notified();
            {
                let state = self.inner.state.lock().await;
                if state.loop_state == LoopState::Idle && state.len() == 0 {
                    return;
                }
            }
            drained.await;
        }
    }
}

async fn run_loop<P>(inner: Arc<QueueInner<P>>)
where
    P: Send + Sync + 'static,
{
    debug!("Dispatch loop started");
    loop {
        let next = inner.state.lock().await.next(Utc::now());
        match next {
            Next::Dispatch(item) => dispatch(&inner, item).await,
            Next::WaitUntil(at) => {
                let until_due = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let wait = until_due.min(inner.config.poll_interval.max(MIN_POLL_INTERVAL));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            Next::Drained => {
                debug!("Dispatch queue drained, loop exiting");
                inner.drained.notify_waiters();
                return;
            }
        }
    }
}

async fn dispatch<P>(inner: &QueueInner<P>, mut item: QueuedItem<P>)
where
    P: Send + Sync + 'static,
{
    inner.limiter.acquire().await;

    let outcome = AssertUnwindSafe(inner.deliverer.deliver(&item.payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(DeliveryError::RequestFailed {
                provider: inner.deliverer.name().to_string(),
                reason: "deliverer panicked".to_string(),
            })
        });

    let error = match outcome {
        Ok(()) => {
            inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
            info!(
                item_id = %item.id,
                priority = %item.priority,
                attempts = item.retry_count + 1,
                provider = inner.deliverer.name(),
                "Item delivered"
            );
            return;
        }
        Err(e) => e,
    };

    let now = Utc::now();
    match inner.retry.on_failure(&mut item, &error, now) {
        RetryDecision::Retry { .. } => {
            inner.counters.retried.fetch_add(1, Ordering::Relaxed);
            inner.state.lock().await.insert(item, now);
        }
        RetryDecision::GiveUp { attempts } => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                item_id = %item.id,
                priority = %item.priority,
                attempts,
                max_retries = item.max_retries,
                created_at = %item.created_at,
                provider = inner.deliverer.name(),
                error = %error,
                "Delivery permanently failed, dropping item"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &'static str, priority: Priority) -> QueuedItem<&'static str> {
        QueuedItem::new(name, EnqueueOptions::default().priority(priority), 3)
    }

    fn drain(state: &mut QueueState<&'static str>, now: DateTime<Utc>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Next::Dispatch(item) = state.next(now) {
            out.push(item.payload);
        }
        out
    }

    #[test]
    fn priority_then_fifo() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.insert(item("low-1", Priority::Low), now);
        state.insert(item("high-1", Priority::High), now);
        state.insert(item("normal-1", Priority::Normal), now);
        state.insert(item("high-2", Priority::High), now);
        state.insert(item("low-2", Priority::Low), now);

        assert_eq!(
            drain(&mut state, now),
            vec!["high-1", "high-2", "normal-1", "low-1", "low-2"]
        );
        assert_eq!(state.loop_state, LoopState::Idle);
    }

    #[test]
    fn future_items_are_invisible_until_due() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(10);
        let mut state = QueueState::new();
        state.insert(
            QueuedItem::new(
                "urgent-later",
                EnqueueOptions::default()
                    .priority(Priority::High)
                    .scheduled_for(later),
                3,
            ),
            now,
        );
        state.insert(item("low-now", Priority::Low), now);

        assert!(matches!(state.next(now), Next::Dispatch(i) if i.payload == "low-now"));
        assert!(matches!(state.next(now), Next::WaitUntil(at) if at == later));
        assert!(matches!(state.next(later), Next::Dispatch(i) if i.payload == "urgent-later"));
        assert!(matches!(state.next(later), Next::Drained));
    }

    #[test]
    fn promoted_items_keep_insertion_order() {
        let now = Utc::now();
        let soon = now + chrono::Duration::seconds(1);
        let mut state = QueueState::new();
        state.insert(
            QueuedItem::new("first", EnqueueOptions::default().scheduled_for(soon), 3),
            now,
        );
        state.insert(item("second", Priority::Normal), now);

        assert_eq!(drain(&mut state, soon), vec!["first", "second"]);
    }

    #[test]
    fn past_schedule_goes_straight_to_ready() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.insert(
            QueuedItem::new(
                "overdue",
                EnqueueOptions::default().scheduled_for(now - chrono::Duration::seconds(5)),
                3,
            ),
            now,
        );
        assert_eq!(state.ready.len(), 1);
        assert!(state.delayed.is_empty());
    }

    #[derive(Default)]
    struct Collect {
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Deliverer<String> for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn deliver(&self, payload: &String) -> Result<(), DeliveryError> {
            self.delivered.lock().await.push(payload.clone());
            Ok(())
        }
    }

    fn quick_config() -> DispatchConfig {
        DispatchConfig {
            rate_limit_per_second: 1000.0,
            max_retries: 0,
            retry_delays: vec![],
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn exited_loop_is_reported_and_replaced() {
        let sink = Arc::new(Collect::default());
        let queue = DispatchQueue::<String>::new(quick_config(), sink.clone());

        let exited = tokio::spawn(async {});
        while !exited.is_finished() {
            tokio::task::yield_now().await;
        }
        {
            let mut state = queue.inner.state.lock().await;
            state.insert(
                QueuedItem::new("orphan".to_string(), EnqueueOptions::default(), 0),
                Utc::now(),
            );
            state.loop_state = LoopState::Running;
            state.loop_task = Some(exited);
        }

        let status = queue.status().await;
        assert!(status.processing);
        assert!(status.stalled);

        queue
            .enqueue("fresh".to_string(), EnqueueOptions::default())
            .await;
        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue did not drain in time");

        assert_eq!(*sink.delivered.lock().await, vec!["orphan", "fresh"]);
        assert!(!queue.status().await.stalled);
    }

    #[tokio::test]
    async fn waiting_on_delayed_items_is_not_stalled() {
        let queue = DispatchQueue::<String>::new(quick_config(), Arc::new(Collect::default()));
        queue
            .enqueue(
                "later".to_string(),
                EnqueueOptions::default().scheduled_for(Utc::now() + chrono::Duration::hours(1)),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let status = queue.status().await;
        assert_eq!(status.delayed, 1);
        assert!(!status.stalled);
        assert!(status.last_progress.is_some());
    }

    #[test]
    fn next_stamps_progress() {
        let now = Utc::now();
        let mut state: QueueState<&'static str> = QueueState::new();
        assert!(state.last_progress.is_none());
        assert!(matches!(state.next(now), Next::Drained));
        assert_eq!(state.last_progress, Some(now));
    }
}
