//! Exponential backoff between redrive attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capped exponential backoff: `min(base * 2^retry_count, max)`.
///
/// This single policy drives both redrive eligibility and `next_retry_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_seconds")]
    pub base_seconds: u64,

    /// Upper bound on any delay, in seconds.
    #[serde(default = "default_max_seconds")]
    pub max_seconds: u64,
}

impl BackoffPolicy {
    pub fn new(base_seconds: u64, max_seconds: u64) -> Self {
        Self {
            base_seconds,
            max_seconds,
        }
    }

    /// Delay to wait after an entry has been retried `retry_count` times.
    pub fn delay(&self, retry_count: u32) -> Duration {
        // 2^32 * base overflows long before the cap matters.
        let factor = 1u64.checked_shl(retry_count.min(32)).unwrap_or(u64::MAX);
        let secs = self.base_seconds.saturating_mul(factor).min(self.max_seconds);
        Duration::from_secs(secs)
    }

    /// Earliest time the next attempt may run.
    pub fn next_retry_at(&self, from: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        from + chrono::Duration::seconds(self.delay(retry_count).as_secs() as i64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_seconds: default_base_seconds(),
            max_seconds: default_max_seconds(),
        }
    }
}

fn default_base_seconds() -> u64 {
    60
}

fn default_max_seconds() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(120));
        assert_eq!(policy.delay(2), Duration::from_secs(240));
        assert_eq!(policy.delay(5), Duration::from_secs(1920));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::new(60, 300);

        assert_eq!(policy.delay(2), Duration::from_secs(240));
        assert_eq!(policy.delay(3), Duration::from_secs(300));
        assert_eq!(policy.delay(40), Duration::from_secs(300));
    }

    #[test]
    fn test_delays_grow_monotonically_then_flatten() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();

        let mut previous = policy.next_retry_at(now, 0);
        for retry_count in 1..20 {
            let next = policy.next_retry_at(now, retry_count);
            assert!(next >= previous);
            if policy.delay(retry_count - 1).as_secs() == policy.max_seconds {
                assert_eq!(next, previous);
            }
            previous = next;
        }
    }
}
