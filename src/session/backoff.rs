//! Reconnect backoff policy

use std::time::Duration;

/// Exponential backoff with a retry limit
///
/// Delays double from `base` and are capped at `max_delay`. After
/// `max_retries` delays, [`Backoff::next_delay`] returns `None`.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_retries: u32,
    base: Duration,
    max_delay: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a policy
    #[must_use]
    pub const fn new(max_retries: u32, base: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base,
            max_delay,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempts);
        self.attempts += 1;
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }

    /// Attempts made since the last reset
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget previous attempts after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(10))
    }
}
