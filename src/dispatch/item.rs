//! Queued item types shared by the queue and the retry policy.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch priority. Variants are declared in dispatch order, so `High < Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// A pending delivery owned by the dispatch queue.
#[derive(Debug, Clone)]
pub struct QueuedItem<P> {
    pub id: Uuid,
    pub payload: P,
    pub priority: Priority,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// Not eligible for dispatch before this instant.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl<P> QueuedItem<P> {
    pub fn new(payload: P, options: EnqueueOptions, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority: options.priority.unwrap_or_default(),
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            scheduled_for: options.scheduled_for,
        }
    }

    /// Whether the item may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_none_or(|at| at <= now)
    }
}
