//! Dispatch Scheduler: rate-limited outbound delivery queue and delayed job
//! scheduling.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod jobs;
pub mod transport;
