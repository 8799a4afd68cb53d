//! Configuration types.
//!
//! Every config struct has a `Default` matching the production defaults and a
//! `from_env()` constructor that overlays environment variables on top of it.
//! Values are read once, when the component is constructed.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default dispatches per second.
pub const DEFAULT_RATE_LIMIT_PER_SECOND: f64 = 1.5;
/// Default retry ceiling per queued item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default backoff table, in milliseconds.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [1000, 2000, 5000];

/// Dispatch queue configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DispatchConfig {
    /// Average ceiling on deliveries per second.
    pub rate_limit_per_second: f64,
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    /// Ordered backoff table; attempts past the end reuse the last entry.
    pub retry_delays: Vec<Duration>,
    /// How long the loop sleeps when nothing is ready.
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delays: DEFAULT_RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl DispatchConfig {
    /// Build from `DISPATCH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rate_limit_per_second = env_parse(
            "DISPATCH_RATE_LIMIT_PER_SECOND",
            defaults.rate_limit_per_second,
        )?;
        let max_retries = env_parse("DISPATCH_MAX_RETRIES", defaults.max_retries)?;

        let retry_delays = match std::env::var("DISPATCH_RETRY_DELAYS_MS") {
            Ok(raw) => parse_delay_list("DISPATCH_RETRY_DELAYS_MS", &raw)?,
            Err(_) => defaults.retry_delays,
        };

        let poll_interval = non_zero(
            "DISPATCH_POLL_INTERVAL_MS",
            Duration::from_millis(env_parse(
                "DISPATCH_POLL_INTERVAL_MS",
                u64::try_from(defaults.poll_interval.as_millis()).unwrap_or(u64::MAX),
            )?),
        )?;

        Ok(Self {
            rate_limit_per_second,
            max_retries,
            retry_delays,
            poll_interval,
        })
    }
}

/// Job scheduler configuration.
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Backend name (`bull` or `agenda`). Resolved when the scheduler is built.
    pub provider: String,
    /// Database file for the persisted backend. `None` keeps it in memory.
    pub database_path: Option<PathBuf>,
    /// Default age threshold for `cleanup_jobs`.
    pub cleanup_after_days: u32,
    /// How often due jobs are picked up for execution.
    pub tick_interval: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            provider: "bull".to_string(),
            database_path: None,
            cleanup_after_days: 7,
            tick_interval: Duration::from_secs(5),
        }
    }
}

impl JobSchedulerConfig {
    /// Build from `JOB_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            provider: std::env::var("JOB_PROVIDER").unwrap_or(defaults.provider),
            database_path: std::env::var("JOB_DB_PATH").ok().map(PathBuf::from),
            cleanup_after_days: env_parse("JOB_CLEANUP_DAYS", defaults.cleanup_after_days)?,
            tick_interval: non_zero(
                "JOB_TICK_INTERVAL_SECS",
                Duration::from_secs(env_parse(
                    "JOB_TICK_INTERVAL_SECS",
                    defaults.tick_interval.as_secs(),
                )?),
            )?,
        })
    }
}

/// Outbound email transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Transport name (`resend` or `smtp`). Resolved when the deliverer is built.
    pub provider: String,
    /// Default sender when a message carries none.
    pub from_address: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: SecretString,
    pub resend_api_key: SecretString,
    pub resend_endpoint: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            provider: "smtp".to_string(),
            from_address: String::new(),
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: SecretString::from(String::new()),
            resend_api_key: SecretString::from(String::new()),
            resend_endpoint: "https://api.resend.com/emails".to_string(),
        }
    }
}

impl TransportConfig {
    /// Build from `EMAIL_*` / `SMTP_*` / `RESEND_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").map_err(|_| {
            ConfigError::MissingRequired {
                key: "EMAIL_FROM_ADDRESS".to_string(),
                hint: "Set the default sender, e.g. bookings@example.com".to_string(),
            }
        })?;

        Ok(Self {
            provider: std::env::var("EMAIL_PROVIDER").unwrap_or(defaults.provider),
            from_address,
            smtp_host: std::env::var("SMTP_HOST").unwrap_or(defaults.smtp_host),
            smtp_port: env_parse("SMTP_PORT", defaults.smtp_port)?,
            smtp_username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            smtp_password: SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default()),
            resend_api_key: SecretString::from(
                std::env::var("RESEND_API_KEY").unwrap_or_default(),
            ),
            resend_endpoint: std::env::var("RESEND_ENDPOINT").unwrap_or(defaults.resend_endpoint),
        })
    }
}

/// Read and parse an environment variable, using `default` when it is unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Reject a zero interval; a zero period would make the loop it drives spin.
fn non_zero(key: &str, interval: Duration) -> Result<Duration, ConfigError> {
    if interval.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(interval)
}

/// Parse a comma-separated list of millisecond delays (`"1000, 2000,5000"`).
pub fn parse_delay_list(key: &str, raw: &str) -> Result<Vec<Duration>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{s:?}: {e}"),
                })
        })
        .collect()
}
