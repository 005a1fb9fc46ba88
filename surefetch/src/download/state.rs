//! Retry bookkeeping for a single download call.
//!
//! Lives only for the duration of one [`DownloadManager`](super::DownloadManager)
//! call and is never persisted.

use std::time::Duration;

use super::backoff::BackoffPolicy;

/// Attempt counter and accumulated backoff wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Retries consumed so far (0 during the first attempt).
    pub attempt: u32,
    /// Sum of all backoff delays waited out.
    pub total_wait: Duration,
    /// Whether any attempt resumed from a partial file.
    pub was_resumed: bool,
    max_retries: u32,
}

impl RetryState {
    /// Create a new retry state allowing `max_retries` retries after the first try.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Check if another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }

    /// Retries left before the call gives up.
    pub fn remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempt)
    }

    /// Consume a retry and return the delay to wait before it.
    ///
    /// Returns `None` when retries are exhausted.
    pub fn next_retry(
        &mut self,
        policy: &BackoffPolicy,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        self.attempt += 1;
        let delay = policy.delay_with_hint(self.attempt, retry_after);
        self.total_wait = self.total_wait.saturating_add(delay);
        Some(delay)
    }

    /// Record that an attempt continued from a partial file.
    pub fn mark_resumed(&mut self) {
        self.was_resumed = true;
    }
}
