//! Exponential Backoff - Capped Retry Delays
//!
//! Shared by the streaming reconnect loop and the supervisor's restart
//! policy: `initial * 2^attempt`, capped at `max`, optionally limited to
//! a number of attempts.

use std::time::Duration;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    initial: Duration,
    /// Ceiling for any single delay.
    max: Duration,
    /// Attempts allowed before giving up (`None` = unbounded).
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    /// Create a policy. `max` below `initial` is raised to `initial`.
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
        }
    }

    /// Delay for a zero-based attempt, ignoring the attempt limit.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Whether another attempt is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }

    /// Delay for `attempt`, or `None` once the attempt limit is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.allows(attempt).then(|| self.delay_for(attempt))
    }

    /// Largest delay this policy produces.
    pub fn max_delay(&self) -> Duration {
        self.max
    }
}
