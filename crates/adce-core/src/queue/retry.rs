//! Retry policy: decides backoff delays and score decay.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::domain::PriorityClass;

/// Retry policy for failed tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay for the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// A task that reaches this many attempts is abandoned.
    pub max_attempts: u32,

    /// Fraction of the in-band bonus kept on each requeue.
    pub score_decay: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_cap_ms),
            max_attempts: config.max_attempts,
            score_decay: config.score_decay,
        }
    }

    /// Delay before the next retry.
    ///
    /// `attempts` is the number of attempts already on the books (0 for a
    /// task that failed on its first run).
    ///
    /// `min(max_delay, base_delay * 2^attempts)`. Example with base=2s:
    /// - attempts 0: 2s
    /// - attempts 1: 4s
    /// - attempts 2: 8s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Decayed score: the in-band bonus shrinks, the class floor stays.
    pub fn decay_score(&self, class: PriorityClass, score: f64) -> f64 {
        let floor = class.floor();
        let bonus = (class.clamp(score) - floor).max(0.0);
        class.clamp(floor + bonus * self.score_decay)
    }

    /// True when one more failure would exhaust the attempt budget.
    pub fn is_exhausted(&self, attempts_after_failure: u32) -> bool {
        attempts_after_failure >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(4));
        assert_eq!(policy.next_delay(2), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_monotonic_up_to_the_cap() {
        let policy = RetryPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..64 {
            let d = policy.next_delay(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= policy.max_delay);
            prev = d;
        }
        assert_eq!(policy.next_delay(63), policy.max_delay);
    }

    #[rstest]
    #[case(PriorityClass::Low)]
    #[case(PriorityClass::Critical)]
    fn decay_never_leaves_the_band(#[case] class: PriorityClass) {
        let policy = RetryPolicy::default();
        let mut score = class.ceiling();
        for _ in 0..20 {
            score = policy.decay_score(class, score);
            assert!(score >= class.floor());
            assert!(score <= class.ceiling());
        }
        assert!(score - class.floor() < 1.0);
    }

    #[test]
    fn decay_halves_the_bonus() {
        let policy = RetryPolicy::default();
        let decayed = policy.decay_score(PriorityClass::High, 3100.0);
        assert_eq!(decayed, 3050.0);
    }
}
