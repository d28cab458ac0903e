//! Redelivery backoff for failed reconciliations.

use std::time::Duration;

/// Exponential backoff with an upper bound.
///
/// Attempt `n` (starting at 1) waits `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first redelivery
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
}

impl Backoff {
    /// Creates a new backoff policy.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Returns the delay before redelivery attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay used for failures that blind retry will not fix.
    ///
    /// The declared resource may still change, so these are retried on the
    /// slowest timer instead of being dropped.
    pub fn fatal_delay(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
