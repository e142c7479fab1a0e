//! Retry policy: decides backoff delays.

use std::time::Duration;

use crate::domain::TaskDefinition;

/// Exponent cap so a large retry budget cannot overflow the delay.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Backoff for failed attempts, derived from a task's own settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Double the delay on every further retry.
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn for_task(task: &TaskDefinition) -> Self {
        Self {
            base_delay: Duration::from_secs(task.retry_delay),
            exponential: task.exponential_backoff,
        }
    }

    /// Delay before the attempt that follows `retry_count` previous retries.
    ///
    /// Exponential: `base_delay * 2^retry_count`
    /// - retry_count 0: base
    /// - retry_count 1: 2 * base
    /// - retry_count 2: 4 * base
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        if !self.exponential {
            return self.base_delay;
        }
        let factor = 1u32 << retry_count.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            exponential: true,
        };

        assert_eq!(policy.next_delay(0), Duration::from_secs(60));
        assert_eq!(policy.next_delay(1), Duration::from_secs(120));
        assert_eq!(policy.next_delay(2), Duration::from_secs(240));
    }

    #[test]
    fn fixed_backoff_stays_flat() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(5),
            exponential: false,
        };
        assert_eq!(policy.next_delay(0), policy.next_delay(7));
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            exponential: true,
        };
        assert_eq!(policy.next_delay(1000), Duration::MAX);
    }
}
