//! Outbound dispatch: priority queue, retry policy and rate limiting.

pub mod item;
pub mod queue;
pub mod rate_limit;
pub mod retry;

pub use item::{EnqueueOptions, Priority, QueuedItem};
pub use queue::{DispatchQueue, DispatchStats, QueueStatus};
pub use rate_limit::RateLimiter;
pub use retry::{RetryDecision, RetryPolicy};
