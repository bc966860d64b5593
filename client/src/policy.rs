//! Reconnect backoff.

use std::time::Duration;

/// How many consecutive failed dials to tolerate and how long to wait
/// between them. Delays start at `base_delay` and double up to `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << doublings)
            .min(self.max_delay)
    }

    #[must_use]
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[cfg(test)]
#[path = "policy_test.rs"]
mod tests;
