//! Bounded exponential backoff for reconnection.
//!
//! Attempt `n` (1-indexed) waits `min(base * 2^(n-1), cap)`. After
//! `max_attempts` consecutive failures the caller must stop retrying.

use std::time::Duration;

use crate::error::ConnectError;

/// Backoff schedule for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Number of retries allowed before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(60_000),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Creates a new policy.
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay to wait before retry `attempt` (1-indexed). Attempt 0 is the
    /// initial connect and has no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    /// All delays of one reconnection cycle, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(move |n| self.delay_for(n))
    }

    /// True once `failures` consecutive retries have used up the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Returns true for open failures worth another attempt.
///
/// Certificate failures are permanent until the configuration changes, and
/// an exhausted or cancelled cycle must not be restarted implicitly.
pub fn is_retryable(error: &ConnectError) -> bool {
    match error {
        ConnectError::ConnectTimeout { .. } => true,
        ConnectError::ConnectRefused { .. } => true,
        ConnectError::Transport(_) => true,
        ConnectError::CertificateValidationFailed { .. } => false,
        ConnectError::ReconnectionExhausted { .. } => false,
        ConnectError::Cancelled => false,
        ConnectError::InvalidState { .. } => false,
    }
}
