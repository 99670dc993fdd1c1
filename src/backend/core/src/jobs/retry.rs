//! Backoff strategies and retry policy for task execution and keepalive pings.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::JobDefaults;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Exponential increase in delay (initial * multiplier^attempt), capped
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
    },
    /// Exponential with random jitter of +/- `jitter_factor`
    ExponentialWithJitter {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => scaled(*initial, *multiplier, attempt).min(*max),
            Self::ExponentialWithJitter {
                initial,
                max,
                multiplier,
                jitter_factor,
            } => {
                let capped = scaled(*initial, *multiplier, attempt).min(*max).as_secs_f64();
                let jitter_range = capped * jitter_factor.clamp(0.0, 1.0);
                let jitter = if jitter_range > 0.0 {
                    rand::rng().random_range(-jitter_range..=jitter_range)
                } else {
                    0.0
                };
                Duration::from_secs_f64((capped + jitter).max(0.0))
            }
        }
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Doubling backoff starting at `initial`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Doubling backoff with 20% jitter.
    pub fn exponential_with_jitter(initial: Duration, max: Duration) -> Self {
        Self::ExponentialWithJitter {
            initial,
            max,
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

fn scaled(initial: Duration, multiplier: f64, attempt: u32) -> Duration {
    let secs = initial.as_secs_f64() * multiplier.powi(attempt.min(63) as i32);
    if secs.is_finite() {
        Duration::from_secs_f64(secs.max(0.0))
    } else {
        Duration::MAX
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry behaviour for the tasks of one job.
///
/// The budget is the job's `max_retries` and is shared by all of its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(jobs: &JobDefaults) -> Self {
        Self {
            backoff: BackoffStrategy::exponential_with_jitter(
                jobs.retry_backoff,
                jobs.retry_backoff_max,
            ),
        }
    }

    /// Check if another retry should be attempted.
    pub fn should_retry(&self, retries_used: u32, max_retries: u32, retryable: bool) -> bool {
        retryable && retries_used < max_retries
    }

    /// Get the delay before the next retry.
    pub fn next_retry_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_fixed() {
        let strategy = BackoffStrategy::fixed(Duration::from_secs(10));
        assert_eq!(strategy.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(strategy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_exponential() {
        let strategy = BackoffStrategy::exponential(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(strategy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(strategy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let strategy =
            BackoffStrategy::exponential_with_jitter(Duration::from_secs(10), Duration::from_secs(10));
        for _ in 0..100 {
            let delay = strategy.delay_for_attempt(3);
            assert!(delay >= Duration::from_secs(8) && delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn test_retry_policy_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0, 3, true));
        assert!(policy.should_retry(2, 3, true));
        assert!(!policy.should_retry(3, 3, true));
        assert!(!policy.should_retry(0, 3, false));
    }
}
