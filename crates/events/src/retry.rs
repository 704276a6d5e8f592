//! Retry/backoff policy for outbox delivery.
//!
//! Pure functions only: given an attempt count (and "now"), decide when the
//! event becomes eligible again and whether it has exhausted its budget.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);

/// Upper bound for any single backoff window.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60 * 60);

/// Failed attempts after which an event is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential backoff with a cap and a retry ceiling.
///
/// `delay(attempt) = min(base * 2^(attempt - 1), max_delay)`
///
/// Deterministic (no jitter): the same attempt count always yields the same
/// delay, which keeps `next_attempt_at` reproducible in tests and in replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay applied after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Attempt count at which the event becomes DEAD.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculate the backoff for a given attempt number (1-indexed).
    ///
    /// Attempt 0 has no delay. Saturates instead of overflowing for very large
    /// attempt counts, so the result is always `<= max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let factor = 1_u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor).min(max_ms);

        Duration::from_millis(delay_ms)
    }

    /// When an event that has failed `attempt` times becomes eligible again.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether an event with `attempt` failures has reached the retry ceiling.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
