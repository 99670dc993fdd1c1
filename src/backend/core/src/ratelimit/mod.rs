//! Outbound rate limiting for marketplace surfaces.
//!
//! Limiter shapes:
//!
//! - [`MinDelayLimiter`]: a randomized gap of `[min, max]` between calls
//! - [`BlockingMinDelayLimiter`]: the same gap for code on blocking threads
//!   (`spawn_blocking`, scripts) that cannot await
//! - [`TokenBucketLimiter`]: burst up to capacity, then the refill rate
//!
//! All are shared by many concurrent callers. Async waiters queue on a
//! `tokio::sync::Mutex`, which is fair, so calls leave the limiter one at a
//! time and in arrival order. Token bucket state sits behind a short
//! `parking_lot` lock that is never held across an await, so
//! [`TokenBucketLimiter::try_acquire`] only fails when the bucket is empty.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{RateLimitSettings, SurfaceLimit};
use crate::error::{ErrorCode, RelistError};
use crate::jobs::Marketplace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("min delay {min:?} exceeds max delay {max:?}")]
    InvertedBounds { min: Duration, max: Duration },

    #[error("token bucket capacity must be positive")]
    ZeroCapacity,

    #[error("token bucket refill must be positive over a non-zero window")]
    ZeroRefill,
}

impl From<RateLimitError> for RelistError {
    fn from(err: RateLimitError) -> Self {
        RelistError::new(ErrorCode::ConfigurationError, "Invalid rate limit settings")
            .with_context("reason", err.to_string())
    }
}

/// Pick a gap uniformly in `[min, max]`.
fn jittered(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let nanos = rand::rng().random_range(min.as_nanos() as u64..=max.as_nanos() as u64);
    Duration::from_nanos(nanos)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Minimum delay
// ═══════════════════════════════════════════════════════════════════════════════

/// Spaces consecutive calls by a random gap of at least `min`.
#[derive(Debug)]
pub struct MinDelayLimiter {
    min: Duration,
    max: Duration,
    last: Mutex<Option<Instant>>,
}

impl MinDelayLimiter {
    pub fn new(min: Duration, max: Duration) -> Result<Self, RateLimitError> {
        if min > max {
            return Err(RateLimitError::InvertedBounds { min, max });
        }
        Ok(Self {
            min,
            max,
            last: Mutex::new(None),
        })
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min, self.max)
    }

    /// Wait until this caller may proceed. The first call never waits.
    pub async fn wait(&self) {
        // Held across the sleep: the next caller measures from our release.
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + jittered(self.min, self.max);
            tokio::time::sleep_until(ready_at).await;
        }
        *last = Some(Instant::now());
    }
}

/// Blocking variant of [`MinDelayLimiter`] for synchronous callers.
#[derive(Debug)]
pub struct BlockingMinDelayLimiter {
    min: Duration,
    max: Duration,
    last: parking_lot::Mutex<Option<std::time::Instant>>,
}

impl BlockingMinDelayLimiter {
    pub fn new(min: Duration, max: Duration) -> Result<Self, RateLimitError> {
        if min > max {
            return Err(RateLimitError::InvertedBounds { min, max });
        }
        Ok(Self {
            min,
            max,
            last: parking_lot::Mutex::new(None),
        })
    }

    /// Block the current thread until the caller may proceed. Returns the
    /// instant the caller was let through; the next caller measures from it.
    pub fn wait_blocking(&self) -> std::time::Instant {
        let mut last = self.last.lock();
        if let Some(previous) = *last {
            let ready_at = previous + jittered(self.min, self.max);
            let now = std::time::Instant::now();
            if ready_at > now {
                std::thread::sleep(ready_at - now);
            }
        }
        let released = std::time::Instant::now();
        *last = Some(released);
        released
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token bucket
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn time_until_available(&self) -> Duration {
        let missing = 1.0 - self.tokens;
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.refill_rate)
        }
    }
}

/// Allows `capacity` calls at once, then `refill` calls per `window`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    bucket: parking_lot::Mutex<TokenBucket>,
    /// Turn order for [`Self::acquire`]
    queue: Mutex<()>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, refill: u32, window: Duration) -> Result<Self, RateLimitError> {
        if capacity == 0 {
            return Err(RateLimitError::ZeroCapacity);
        }
        if refill == 0 || window.is_zero() {
            return Err(RateLimitError::ZeroRefill);
        }
        Ok(Self {
            bucket: parking_lot::Mutex::new(TokenBucket {
                tokens: capacity as f64,
                capacity: capacity as f64,
                refill_rate: refill as f64 / window.as_secs_f64(),
                last_refill: Instant::now(),
            }),
            queue: Mutex::new(()),
        })
    }

    /// Take a token, or report how long until one refills.
    fn take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(bucket.time_until_available())
        }
    }

    /// Take a token if one is available right now. Never waits behind a
    /// sleeping [`Self::acquire`].
    pub fn try_acquire(&self) -> bool {
        self.take().is_ok()
    }

    /// Wait for a token and take it.
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        while let Err(wait) = self.take() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens as u32
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-surface limiters
// ═══════════════════════════════════════════════════════════════════════════════

/// Limiter for one remote surface: optional quota, then spacing.
#[derive(Debug)]
pub struct SurfaceLimiter {
    delay: MinDelayLimiter,
    bucket: Option<TokenBucketLimiter>,
}

impl SurfaceLimiter {
    pub fn from_settings(limit: &SurfaceLimit) -> Result<Self, RateLimitError> {
        let bucket = match (limit.bucket_capacity, limit.bucket_refill) {
            (Some(capacity), refill) => Some(TokenBucketLimiter::new(
                capacity,
                refill.unwrap_or(capacity),
                limit.bucket_window,
            )?),
            (None, _) => None,
        };
        Ok(Self {
            delay: MinDelayLimiter::new(limit.min_delay, limit.max_delay)?,
            bucket,
        })
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self {
            delay: MinDelayLimiter {
                min: Duration::ZERO,
                max: Duration::ZERO,
                last: Mutex::new(None),
            },
            bucket: None,
        }
    }

    pub async fn wait(&self) {
        if let Some(bucket) = &self.bucket {
            bucket.acquire().await;
        }
        self.delay.wait().await;
    }
}

/// One [`SurfaceLimiter`] per marketplace.
#[derive(Debug, Clone)]
pub struct LimiterSet {
    limiters: HashMap<Marketplace, Arc<SurfaceLimiter>>,
}

impl LimiterSet {
    pub fn from_settings(settings: &RateLimitSettings) -> Result<Self, RateLimitError> {
        let mut limiters = HashMap::new();
        for marketplace in Marketplace::ALL {
            let limiter = SurfaceLimiter::from_settings(settings.for_marketplace(marketplace))?;
            limiters.insert(marketplace, Arc::new(limiter));
        }
        Ok(Self { limiters })
    }

    /// Limiters that never wait, for tests and local runs.
    pub fn unlimited() -> Self {
        Self {
            limiters: Marketplace::ALL
                .into_iter()
                .map(|m| (m, Arc::new(SurfaceLimiter::unlimited())))
                .collect(),
        }
    }

    pub fn get(&self, marketplace: Marketplace) -> Arc<SurfaceLimiter> {
        self.limiters
            .get(&marketplace)
            .cloned()
            .unwrap_or_else(|| Arc::new(SurfaceLimiter::unlimited()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = MinDelayLimiter::new(Duration::from_secs(2), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RateLimitError::InvertedBounds { .. }));
        assert!(TokenBucketLimiter::new(0, 1, Duration::from_secs(1)).is_err());
        assert!(TokenBucketLimiter::new(1, 0, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_jitter_within_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(200);
        for _ in 0..100 {
            let gap = jittered(min, max);
            assert!(gap >= min && gap <= max);
        }
        assert_eq!(jittered(min, min), min);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_delay_spacing() {
        let min = Duration::from_millis(300);
        let limiter = MinDelayLimiter::new(min, Duration::from_millis(500)).unwrap();

        let mut previous = None;
        for _ in 0..5 {
            limiter.wait().await;
            let now = Instant::now();
            if let Some(previous) = previous {
                assert!(now - previous >= min);
            }
            previous = Some(now);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_delay_concurrent_callers() {
        let min = Duration::from_millis(100);
        let limiter = Arc::new(MinDelayLimiter::new(min, Duration::from_millis(150)).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.wait().await;
                    Instant::now()
                })
            })
            .collect();

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= min);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_refill() {
        let limiter = TokenBucketLimiter::new(3, 1, Duration::from_secs(1)).unwrap();
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        limiter.acquire().await;
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_millis(999));
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_acquire_is_pending() {
        let limiter = TokenBucketLimiter::new(1, 1, Duration::from_secs(60)).unwrap();
        assert!(limiter.try_acquire());

        let mut acquire = tokio_test::task::spawn(limiter.acquire());
        tokio_test::assert_pending!(acquire.poll());

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio_test::assert_ready!(acquire.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_not_blocked_by_sleeping_waiter() {
        let limiter = TokenBucketLimiter::new(1, 1, Duration::from_secs(10)).unwrap();
        assert!(limiter.try_acquire());

        let mut waiter = tokio_test::task::spawn(limiter.acquire());
        tokio_test::assert_pending!(waiter.poll());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.try_acquire());
        assert_eq!(limiter.available(), 0);

        // The waiter goes back to sleep for the next token.
        tokio_test::assert_pending!(waiter.poll());
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn test_blocking_min_delay_spacing() {
        let min = Duration::from_millis(20);
        let limiter = BlockingMinDelayLimiter::new(min, Duration::from_millis(30)).unwrap();

        let released: Vec<_> = (0..4).map(|_| limiter.wait_blocking()).collect();
        for pair in released.windows(2) {
            assert!(pair[1] - pair[0] >= min);
        }
    }

    #[test]
    fn test_blocking_min_delay_across_threads() {
        let min = Duration::from_millis(15);
        let limiter = BlockingMinDelayLimiter::new(min, min).unwrap();

        let mut released: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| limiter.wait_blocking()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        released.sort();
        for pair in released.windows(2) {
            assert!(pair[1] - pair[0] >= min);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_set_never_waits() {
        let set = LimiterSet::unlimited();
        let start = Instant::now();
        for _ in 0..10 {
            set.get(Marketplace::Vinted).wait().await;
        }
        assert_eq!(Instant::now(), start);
    }
}
