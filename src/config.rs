//! Policy inputs for the offline content subsystem.
//!
//! [`OfflineSettings`] carries every environment-level knob the components
//! read: network policy, concurrency cap, retry budget, retention, and
//! transport timeouts. Values are validated once at startup; components
//! receive the already-validated struct.

use std::time::Duration;

use thiserror::Error;

use crate::clock::DAY_MILLIS;

/// Default cap on simultaneously downloading tasks.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

/// Default retry budget per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default minimum spacing between progress notifications for one task.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Default HTTP connect timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large audio files).
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

const MAX_CONCURRENT_TRANSFERS: usize = 16;
const MAX_RETRIES_LIMIT: u32 = 20;
const MAX_AUTO_DOWNLOAD_NEXT_UNITS: u32 = 50;
const MAX_RETENTION_DAYS: u32 = 3650;
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

/// Invalid configuration value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric field is outside its accepted range.
    #[error("invalid value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Field name as spelled in the config file.
        field: &'static str,
        /// Offending value, rendered.
        value: String,
        /// Human-readable accepted range.
        expected: &'static str,
    },
}

impl ConfigError {
    fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Environment-level policy inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineSettings {
    /// Only transfer over Wi-Fi.
    pub wifi_only: bool,
    /// How many upcoming units to prefetch into the ephemeral tier.
    pub auto_download_next_units: u32,
    /// Concurrency cap for the scheduler.
    pub max_concurrent_transfers: usize,
    /// When set, new content records expire this many days after request.
    pub retention_days: Option<u32>,
    /// Retry budget assigned to new tasks.
    pub max_retries: u32,
    /// Backoff base delay.
    pub retry_base_delay: Duration,
    /// Backoff cap.
    pub retry_max_delay: Duration,
    /// Upper bound for random jitter added to each backoff delay.
    pub retry_jitter: Duration,
    /// Progress throttle interval.
    pub progress_interval: Duration,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
    /// Ephemeral tier budget; oldest entries are evicted above it.
    pub ephemeral_cache_limit_bytes: Option<u64>,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            wifi_only: false,
            auto_download_next_units: 0,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            retention_days: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
            retry_jitter: Duration::from_millis(250),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            ephemeral_cache_limit_bytes: None,
        }
    }
}

impl OfflineSettings {
    /// Validates every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CONCURRENT_TRANSFERS).contains(&self.max_concurrent_transfers) {
            return Err(ConfigError::out_of_range(
                "max_concurrent_transfers",
                self.max_concurrent_transfers,
                "1..=16",
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::out_of_range(
                "max_retries",
                self.max_retries,
                "0..=20",
            ));
        }
        if self.auto_download_next_units > MAX_AUTO_DOWNLOAD_NEXT_UNITS {
            return Err(ConfigError::out_of_range(
                "auto_download_next_units",
                self.auto_download_next_units,
                "0..=50",
            ));
        }
        if let Some(days) = self.retention_days
            && !(1..=MAX_RETENTION_DAYS).contains(&days)
        {
            return Err(ConfigError::out_of_range(
                "retention_days",
                days,
                "1..=3650",
            ));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::out_of_range(
                "retry_max_delay",
                format!("{}ms", self.retry_max_delay.as_millis()),
                ">= retry_base_delay",
            ));
        }
        if self.progress_interval < MIN_PROGRESS_INTERVAL {
            return Err(ConfigError::out_of_range(
                "progress_interval",
                format!("{}ms", self.progress_interval.as_millis()),
                ">= 50ms",
            ));
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }

    /// Expiry timestamp for a record requested at `requested_at`, if retention is configured.
    #[must_use]
    pub fn expires_at(&self, requested_at: i64) -> Option<i64> {
        self.retention_days
            .map(|days| requested_at.saturating_add(i64::from(days).saturating_mul(DAY_MILLIS)))
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::out_of_range(field, value, "1..=3600"));
    }
    Ok(())
}
