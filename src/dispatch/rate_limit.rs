//! Process-wide minimum interval between dispatches.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Single-token rate limiter: grants at most one permit per `min_interval`.
///
/// There is no burst capacity. Callers that arrive early are suspended for
/// the remainder of the interval; concurrent callers are served one at a time.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter for `rate_per_second` grants. Non-positive rates disable it.
    ///
    /// Rates so small that the interval overflows `Duration` saturate at
    /// `Duration::MAX`.
    pub fn new(rate_per_second: f64) -> Self {
        let min_interval = if rate_per_second.is_finite() && rate_per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / rate_per_second).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last_grant: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a dispatch is permitted, then record the grant.
    pub async fn acquire(&self) {
        let mut last = self.last_grant.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limit wait");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_from_rate() {
        assert_eq!(RateLimiter::new(2.0).min_interval(), Duration::from_millis(500));
        assert_eq!(RateLimiter::new(0.0).min_interval(), Duration::ZERO);
        assert_eq!(RateLimiter::new(f64::NAN).min_interval(), Duration::ZERO);
    }

    #[test]
    fn tiny_rate_saturates_interval() {
        assert_eq!(RateLimiter::new(1e-20).min_interval(), Duration::MAX);
        assert_eq!(RateLimiter::new(f64::MIN_POSITIVE).min_interval(), Duration::MAX);
        assert_eq!(RateLimiter::new(0.5).min_interval(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_rate_first_acquire_does_not_wait() {
        let limiter = RateLimiter::new(1e-20);
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::new(1.0);
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_acquires_are_spaced() {
        let limiter = RateLimiter::new(4.0);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_after_idle_gap() {
        let limiter = RateLimiter::new(1.0);
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
