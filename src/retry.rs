//! Retry policy for failed jobs.
//!
//! Backoff is linear: the n-th failure of a job schedules the next attempt
//! `n * base_delay` in the future.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts a job gets before it is marked FAILED.
    pub max_attempts: i32,
    /// Delay unit multiplied by the attempt count.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: i32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the next attempt, given the attempts made so far (including the one that just failed).
    pub fn backoff(&self, attempts: i32) -> Duration {
        self.base_delay
            .checked_mul(attempts.max(1) as u32)
            .unwrap_or(Duration::MAX)
    }

    /// Whether a job with `attempts` failed attempts out of `max_attempts` may run again.
    pub fn should_retry(&self, attempts: i32, max_attempts: i32) -> bool {
        attempts < max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30));

        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(4), Duration::from_secs(120));
    }

    #[test]
    fn backoff_never_drops_to_zero() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(3, Duration::from_secs(u64::MAX / 2));
        assert_eq!(policy.backoff(i32::MAX), Duration::MAX);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, 3));
        assert!(policy.should_retry(2, 3));
        assert!(!policy.should_retry(3, 3));
    }
}
