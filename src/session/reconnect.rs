//! Reconnection policy
//!
//! Decides whether a failed session gets another connect attempt and how
//! long to wait before it.

use std::time::Duration;

use crate::ssh::ErrorKind;

/// Retry policy carried by every connection config
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of automatic reconnect attempts
    pub max_retries: u32,
    /// Delay before the first retry
    pub retry_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(2000),
            backoff_multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `retry_count` (0-indexed):
    /// `retry_delay * backoff_multiplier ^ retry_count`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.retry_delay.as_millis() as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay = base * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.round().min(u64::MAX as f64) as u64)
    }

    /// Authentication failures are never retried: the same credentials
    /// cannot succeed on the next attempt.
    pub fn should_retry(&self, kind: ErrorKind, retry_count: u32) -> bool {
        kind != ErrorKind::AuthFailed && retry_count < self.max_retries
    }
}
