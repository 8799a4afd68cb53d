//! Error types for the dispatch and scheduling subsystem.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
}

/// Errors returned by a delivery transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Provider {provider} rejected the message: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Job validation and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Scheduled time must be in the future")]
    NotInFuture,

    #[error("Job type is required")]
    TypeRequired,

    #[error("Job {id} already exists")]
    Duplicate { id: String },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),

    #[error("No handler registered for job type {job_type}")]
    NoHandler { job_type: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Job store (backend) errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
