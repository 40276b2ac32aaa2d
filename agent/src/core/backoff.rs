//! Bounded exponential backoff policy for provider retries.
//!
//! Delay computation is pure: callers pass the jitter sample so tests can pin
//! it and the orchestrator never depends on wall-clock sleeps to be correct.

use std::time::Duration;

/// Exponential backoff multiplier between consecutive retries.
const BACKOFF_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per provider, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is permitted after `attempts_made` attempts.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// The exponential delay is capped at `max_backoff`; `jitter` in `[0, 1)`
    /// spreads the second half of it ("equal jitter").
    pub fn delay_for(&self, retry: u32, jitter: f64) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let factor = BACKOFF_MULTIPLIER.saturating_pow(exponent);
        let base = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        let half = base / 2;
        half + half.mul_f64(jitter.clamp(0.0, 1.0))
    }
}
