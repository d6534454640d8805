//! Retry logic with exponential backoff for failed transfers.
//!
//! When a transfer fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - timeouts, resets, 5xx, corrupt payloads
//! - [`FailureType::ExpiredSource`] - 4xx; the source must be re-resolved
//! - [`FailureType::Storage`] - local disk problems, never retried
//! - [`FailureType::Permanent`] - malformed source or unknown unit
//!
//! Transient and expired-source failures consume the task's retry budget.
//! Connectivity loss is not a failure at all: it pauses the task.
//!
//! # Example
//!
//! ```
//! use offline_content::transfer::{
//!     classify_error, FailureType, RetryDecision, RetryPolicy, TransferError,
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = TransferError::http_status("https://cdn.example.com/1.mp3", 503);
//! let failure = classify_error(&error);
//!
//! match policy.should_retry(failure, 0, 3) {
//!     RetryDecision::Retry { delay, retry_count } => {
//!         println!("retry #{retry_count} in {delay:?}");
//!     }
//!     RetryDecision::DoNotRetry { reason, .. } => println!("giving up: {reason}"),
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::TransferError;
use crate::config::OfflineSettings;

/// Default base delay for exponential backoff.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default maximum delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default upper bound for jitter added to each delay.
const DEFAULT_JITTER: Duration = Duration::from_millis(250);

/// Longest server-mandated wait honoured from `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of transfer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// The remote rejected the request (4xx). The source location is
    /// re-resolved through the content API before the next attempt.
    ExpiredSource,

    /// Disk full, permission denied or another local storage fault.
    /// Surfaced immediately without retry.
    Storage,

    /// Will not succeed regardless of retries.
    Permanent,
}

impl FailureType {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ExpiredSource => "expired_source",
            Self::Storage => "storage",
            Self::Permanent => "permanent",
        }
    }

    /// Whether this failure spends retry budget and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::ExpiredSource)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "expired_source" => Ok(Self::ExpiredSource),
            "storage" => Ok(Self::Storage),
            "permanent" => Ok(Self::Permanent),
            _ => Err(format!("invalid failure type: {s}")),
        }
    }
}

/// Decision on whether to retry a failed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue after `delay`.
    Retry {
        /// How long to wait before the task becomes admissible again.
        delay: Duration,
        /// Retry count to persist.
        retry_count: u32,
    },

    /// Move the task to `failed`.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
        /// Retry count to persist.
        retry_count: u32,
    },
}

/// Backoff configuration.
///
/// ```text
/// delay = min(base_delay * 2^(retry_count - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    /// Builds the policy from validated settings.
    #[must_use]
    pub fn from_settings(settings: &OfflineSettings) -> Self {
        Self::new(
            settings.retry_base_delay,
            settings.retry_max_delay,
            settings.retry_jitter,
        )
    }

    /// Decides what happens after a failure.
    ///
    /// `retry_count` is the task's count before this failure. A retryable
    /// failure increments it; once the incremented count reaches
    /// `max_retries` the task fails.
    #[instrument(skip(self))]
    pub fn should_retry(
        &self,
        failure: FailureType,
        retry_count: u32,
        max_retries: u32,
    ) -> RetryDecision {
        if !failure.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: format!("{failure} failure - retry would not help"),
                retry_count,
            };
        }

        let next = retry_count.saturating_add(1);
        if next >= max_retries {
            debug!(next, max_retries, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({max_retries}) exhausted"),
                retry_count: next,
            };
        }

        let delay = self.calculate_delay(next);
        debug!(retry_count = next, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry {
            delay,
            retry_count: next,
        }
    }

    /// `min(base * 2^(retry_count - 1), max) + jitter`.
    fn calculate_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let scaled = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        scaled.min(self.max_delay) + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

/// Classifies a transfer error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | 408, 429, 5xx | Transient |
/// | other 4xx | ExpiredSource |
/// | Timeout, Network | Transient |
/// | Integrity | Transient (staged file is discarded) |
/// | Io, Content | Storage |
/// | InvalidUrl, Client | Permanent |
/// | Resolve (not found) | Permanent |
/// | Resolve (other) | Transient |
#[instrument]
pub fn classify_error(error: &TransferError) -> FailureType {
    match error {
        TransferError::HttpStatus { status, .. } => classify_http_status(*status),
        TransferError::Timeout { .. }
        | TransferError::Network { .. }
        | TransferError::Integrity { .. } => FailureType::Transient,
        TransferError::Io { .. } | TransferError::Content(_) => FailureType::Storage,
        TransferError::InvalidUrl { .. } | TransferError::Client(_) => FailureType::Permanent,
        TransferError::Resolve { not_found, .. } => {
            if *not_found {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient, // Request Timeout
        429 => FailureType::Transient, // Too Many Requests
        status if (400..500).contains(&status) => FailureType::ExpiredSource,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Server-mandated delay carried by a `429`/`503` error, if any.
///
/// Replaces the computed backoff for that retry; it never changes whether
/// the failure is retried.
#[must_use]
pub fn server_retry_delay(error: &TransferError) -> Option<Duration> {
    match error {
        TransferError::HttpStatus {
            status: 429 | 503,
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

/// Parses a `Retry-After` value: delta seconds or an HTTP-date.
///
/// Values above one hour are capped; negative, past or unparseable values
/// yield `None`.
///
/// ```
/// use std::time::Duration;
/// use offline_content::transfer::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let delay = if let Ok(seconds) = value.parse::<i64>() {
        Duration::from_secs(u64::try_from(seconds).ok()?)
    } else {
        let at = httpdate::parse_http_date(value).ok()?;
        at.duration_since(std::time::SystemTime::now()).ok()?
    };
    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping"
        );
        return Some(MAX_RETRY_AFTER);
    }
    Some(delay)
}
