//! Shared backoff policy.
//!
//! One implementation serves the three retry sites: the per-endpoint HTTP
//! retry loop, the persistent-queue replay schedule, and job retries.

use std::time::Duration;

/// Exponential backoff: `base * factor^(attempt - 1)`, capped at `max`.
///
/// Attempts are 1-based; attempt 1 is the first retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl BackoffPolicy {
    pub const fn new(base: Duration, factor: u32, max: Duration) -> Self {
        Self { base, factor, max }
    }

    /// Defaults used by the HTTP delivery loop: 1s base, doubling, 10s cap.
    pub const fn http() -> Self {
        Self::new(Duration::from_secs(1), 2, Duration::from_secs(10))
    }

    /// Replay schedule for the persistent retry queue: minutes, doubling.
    ///
    /// `delay(retry_count + 1)` yields `2^retry_count` minutes.
    pub const fn replay() -> Self {
        Self::new(Duration::from_secs(60), 2, Duration::from_secs(3600))
    }

    /// Job retry schedule: `retry_delay * 2^(retry_count - 1)`.
    pub const fn job(retry_delay: Duration) -> Self {
        Self::new(retry_delay, 2, Duration::from_secs(300))
    }

    /// Delay before the given 1-based retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        self.scaled(exp, 1)
    }

    /// Penalty delay after an HTTP 429: one extra doubling on top of the
    /// regular schedule, still capped at `max`.
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.scaled(attempt, 2)
    }

    fn scaled(&self, exponent: u32, multiplier: u32) -> Duration {
        let factor = self
            .factor
            .checked_pow(exponent)
            .and_then(|f| f.checked_mul(multiplier));
        match factor.and_then(|f| self.base.checked_mul(f)) {
            Some(delay) => delay.min(self.max),
            None => self.max,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::http()
    }
}
