//! Retry policy: failure + attempt count → backoff or give up.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::DispatchConfig;
use crate::dispatch::item::QueuedItem;
use crate::error::DeliveryError;

/// Backoff used when the delay table is empty.
pub const FALLBACK_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-insert the item after `delay`. `attempt` is the retry number (1-based).
    Retry { attempt: u32, delay: Duration },
    /// Retry budget exhausted; drop the item. `attempts` counts every delivery try.
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_retries,
            delays,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.max_retries, config.retry_delays.clone())
    }

    /// Backoff before retry number `attempt` (1-based), clamped to the table.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        self.delays
            .get(idx)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(FALLBACK_RETRY_DELAY)
    }

    /// Record a failed attempt on `item` and decide what happens next.
    ///
    /// On `Retry` the item's `scheduled_for` is moved to `now + delay`.
    pub fn on_failure<P>(
        &self,
        item: &mut QueuedItem<P>,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        item.retry_count += 1;

        if item.retry_count > item.max_retries {
            return RetryDecision::GiveUp {
                attempts: item.retry_count,
            };
        }

        let delay = self.delay_for(item.retry_count);
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|backoff| now.checked_add_signed(backoff))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        item.scheduled_for = Some(retry_at);

        tracing::warn!(
            item_id = %item.id,
            attempt = item.retry_count,
            max_retries = item.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Delivery failed, scheduling retry"
        );

        RetryDecision::Retry {
            attempt: item.retry_count,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::item::EnqueueOptions;

    fn failure() -> DeliveryError {
        DeliveryError::RequestFailed {
            provider: "test".into(),
            reason: "boom".into(),
        }
    }

    #[test]
    fn delays_clamp_to_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(9), Duration::from_secs(5));
    }

    #[test]
    fn empty_table_uses_fallback() {
        let policy = RetryPolicy::new(3, Vec::new());
        assert_eq!(policy.delay_for(1), FALLBACK_RETRY_DELAY);
        assert_eq!(policy.delay_for(7), FALLBACK_RETRY_DELAY);
    }

    #[test]
    fn retry_reschedules_item() {
        let policy = RetryPolicy::default();
        let mut item = QueuedItem::new((), EnqueueOptions::default(), 3);
        let now = Utc::now();

        let decision = policy.on_failure(&mut item, &failure(), now);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.scheduled_for, Some(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn gives_up_after_budget() {
        let policy = RetryPolicy::new(2, vec![Duration::from_millis(10)]);
        let mut item = QueuedItem::new((), EnqueueOptions::default(), 2);
        let now = Utc::now();

        assert!(matches!(
            policy.on_failure(&mut item, &failure(), now),
            RetryDecision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            policy.on_failure(&mut item, &failure(), now),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(
            policy.on_failure(&mut item, &failure(), now),
            RetryDecision::GiveUp { attempts: 3 }
        );
    }

    #[test]
    fn zero_retries_is_immediately_terminal() {
        let policy = RetryPolicy::new(0, vec![Duration::from_secs(1)]);
        let mut item = QueuedItem::new((), EnqueueOptions::default(), 0);
        assert_eq!(
            policy.on_failure(&mut item, &failure(), Utc::now()),
            RetryDecision::GiveUp { attempts: 1 }
        );
        assert!(item.scheduled_for.is_none());
    }
}
