use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Tunables for the provider and its subscription channels.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Failed connection attempts tolerated per channel before giving up.
    pub max_retries: u32,
    /// Fixed delay between connection attempts.
    pub retry_delay: Duration,
    /// If no channel has subscribed within this window after mount, a
    /// connection error is reported.
    pub connect_timeout: Duration,
    /// Capacity of the user-notification broadcast channel.
    pub notification_buffer: usize,
    /// Capacity of the applied-change broadcast channel.
    pub change_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            notification_buffer: 64,
            change_buffer: 1000,
        }
    }
}

impl SyncConfig {
    /// Load overrides from `REGSYNC_*` environment variables.
    ///
    /// Unset or malformed variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("REGSYNC_MAX_RETRIES", defaults.max_retries),
            retry_delay: Duration::from_secs(env_or("REGSYNC_RETRY_DELAY_SECS", 3)),
            connect_timeout: Duration::from_secs(env_or("REGSYNC_CONNECT_TIMEOUT_SECS", 10)),
            ..defaults
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid {} value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
