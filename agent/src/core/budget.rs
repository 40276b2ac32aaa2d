//! Shared time budget helpers for deterministic orchestration.

use std::time::{Duration, Instant};

use thiserror::Error;

/// The process-wide run deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run deadline exceeded")]
pub struct DeadlineExceeded;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration, DeadlineExceeded> {
    remaining_budget_at(deadline, Instant::now())
}

/// Cap `timeout` to whatever remains of the run budget.
pub fn clamp_to_budget(timeout: Duration, deadline: Instant) -> Result<Duration, DeadlineExceeded> {
    Ok(timeout.min(remaining_budget(deadline)?))
}

fn remaining_budget_at(deadline: Instant, now: Instant) -> Result<Duration, DeadlineExceeded> {
    let remaining = deadline
        .checked_duration_since(now)
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(DeadlineExceeded);
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_is_exceeded() {
        let now = Instant::now();
        assert_eq!(remaining_budget_at(now, now), Err(DeadlineExceeded));
    }

    #[test]
    fn future_deadline_reports_remaining() {
        let now = Instant::now();
        let remaining =
            remaining_budget_at(now + Duration::from_secs(5), now).expect("budget remains");
        assert_eq!(remaining, Duration::from_secs(5));
    }

    #[test]
    fn clamp_prefers_the_shorter_duration() {
        let deadline = Instant::now() + Duration::from_secs(3600);
        let clamped = clamp_to_budget(Duration::from_secs(2), deadline).expect("clamp");
        assert_eq!(clamped, Duration::from_secs(2));
    }
}
