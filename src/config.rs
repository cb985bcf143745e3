//! Sync-layer configuration parsed from environment variables.
//!
//! Every knob has a default, so an empty environment yields a working config
//! pointed at a local server. Durations are read as integer milliseconds or
//! seconds, matching the variable suffix.

use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_GC_IDLE_SECS: u64 = 300;
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_INBOX_CAPACITY: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base URL '{0}' (expected http:// or https://)")]
    InvalidBaseUrl(String),
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Bounded reconnect schedule for the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts after an unexpected disconnect before giving up.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Add up to 20% random jitter to every delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// HTTP base URL of the server; the websocket URL is derived from it.
    pub base_url: String,
    pub reconnect: ReconnectPolicy,
    /// Freshness window applied by `ensure_fresh`. `None` never auto-stales.
    pub default_stale_after: Option<Duration>,
    /// Idle lifetime of an unobserved, stale cache entry before GC evicts it.
    pub gc_idle: Duration,
    pub gc_interval: Duration,
    /// Deadline for request/response round trips over the realtime link.
    pub request_timeout: Duration,
    pub inbox_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            reconnect: ReconnectPolicy::default(),
            default_stale_after: None,
            gc_idle: Duration::from_secs(DEFAULT_GC_IDLE_SECS),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `TASKSYNC_BASE_URL`: default `http://127.0.0.1:3000`
    /// - `TASKSYNC_RECONNECT_ATTEMPTS`: default 5
    /// - `TASKSYNC_BACKOFF_MS` / `TASKSYNC_MAX_BACKOFF_MS`: default 1000 / 10000
    /// - `TASKSYNC_BACKOFF_JITTER`: `true` (default) or `false`
    /// - `TASKSYNC_STALE_AFTER_MS`: unset means entries never auto-stale
    /// - `TASKSYNC_GC_IDLE_SECS` / `TASKSYNC_GC_INTERVAL_SECS`: default 300 / 60
    /// - `TASKSYNC_REQUEST_TIMEOUT_MS`: default 10000
    /// - `TASKSYNC_INBOX_CAPACITY`: default 200
    ///
    /// # Errors
    ///
    /// Returns an error for a non-http base URL or a zero GC interval / inbox capacity.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("TASKSYNC_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidBaseUrl(base_url));
        }

        let reconnect = ReconnectPolicy {
            max_attempts: env_parse("TASKSYNC_RECONNECT_ATTEMPTS", DEFAULT_RECONNECT_ATTEMPTS),
            initial_backoff: Duration::from_millis(env_parse("TASKSYNC_BACKOFF_MS", DEFAULT_BACKOFF_MS)),
            max_backoff: Duration::from_millis(env_parse("TASKSYNC_MAX_BACKOFF_MS", DEFAULT_MAX_BACKOFF_MS)),
            jitter: env_parse("TASKSYNC_BACKOFF_JITTER", true),
        };

        let default_stale_after = std::env::var("TASKSYNC_STALE_AFTER_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);

        let gc_interval_secs = env_parse("TASKSYNC_GC_INTERVAL_SECS", DEFAULT_GC_INTERVAL_SECS);
        if gc_interval_secs == 0 {
            return Err(ConfigError::Zero { var: "TASKSYNC_GC_INTERVAL_SECS" });
        }
        let inbox_capacity = env_parse("TASKSYNC_INBOX_CAPACITY", DEFAULT_INBOX_CAPACITY);
        if inbox_capacity == 0 {
            return Err(ConfigError::Zero { var: "TASKSYNC_INBOX_CAPACITY" });
        }

        Ok(Self {
            base_url,
            reconnect,
            default_stale_after,
            gc_idle: Duration::from_secs(env_parse("TASKSYNC_GC_IDLE_SECS", DEFAULT_GC_IDLE_SECS)),
            gc_interval: Duration::from_secs(gc_interval_secs),
            request_timeout: Duration::from_millis(env_parse(
                "TASKSYNC_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )),
            inbox_capacity,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
