//! Exponential backoff between retry attempts.
//!
//! The delay doubles with each retry starting from the initial delay and is
//! capped at the maximum:
//!
//! ```text
//! attempt:  1     2     3     4     5     6
//! delay:    1s    2s    4s    8s    16s   30s (cap)
//! ```
//!
//! Everything here is pure: no clocks, no I/O.

use std::time::Duration;

/// Default initial delay before the first retry (1 second).
pub const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 1;

/// Default maximum delay between retries (30 seconds).
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;

/// Calculate the delay before retry number `attempt`.
///
/// `attempt` is 1-based (1 is the first retry); 0 is treated as 1. The
/// result is `initial * 2^(attempt - 1)`, saturating, and never exceeds
/// `max`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use surefetch::download::backoff_delay;
///
/// let initial = Duration::from_secs(1);
/// let max = Duration::from_secs(30);
///
/// assert_eq!(backoff_delay(1, initial, max), Duration::from_secs(1));
/// assert_eq!(backoff_delay(3, initial, max), Duration::from_secs(4));
/// assert_eq!(backoff_delay(10, initial, max), Duration::from_secs(30));
/// ```
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier = 2_u32.saturating_pow(exponent);
    initial.saturating_mul(multiplier).min(max)
}

/// Backoff bounds resolved for one download call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_INITIAL_BACKOFF_SECS),
            Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        )
    }
}

impl BackoffPolicy {
    /// Create a policy. A `max` below `initial` caps every delay at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.initial, self.max)
    }

    /// Delay before retry `attempt`, raised to a server `Retry-After` hint.
    ///
    /// The hint never pushes the delay past `max`.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for(attempt);
        match retry_after {
            Some(hint) => delay.max(hint).min(self.max),
            None => delay,
        }
    }
}
