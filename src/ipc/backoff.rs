//! Exponential reconnection backoff.

use std::time::Duration;

/// Reconnection backoff policy.
///
/// The delay before attempt `n` (0-based) is `min(initial * 2^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay for a 0-based attempt number. Saturates at `max` instead of
    /// overflowing for large attempt numbers.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            max_attempts: 10,
        };

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(1600));

        // Should cap at max
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(2));
    }

    #[test]
    fn test_non_decreasing_until_saturation() {
        let backoff = Backoff::default();
        let delays: Vec<_> = (0..40).map(|n| backoff.delay_for_attempt(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), backoff.max);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for_attempt(u32::MAX), backoff.max);
    }

    #[test]
    fn test_attempt_budget() {
        let backoff = Backoff { max_attempts: 3, ..Backoff::default() };
        assert!(backoff.allows(2));
        assert!(!backoff.allows(3));
    }
}
