//! Requeue rate limiters: per-key exponential backoff, an overall token
//! bucket, and a max-of combiner. The default pairs a 200ms..1000s
//! per-key curve with a 10/s burst-100 bucket.

use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as DirectLimiter};
use nonzero_ext::nonzero;
use rustc_hash::FxHashMap;

pub trait RateLimiter: Send + Sync {
    /// Delay to apply before the key runs again. May record a failure.
    fn when(&self, key: &str) -> Duration;
    /// Clear any history for the key.
    fn forget(&self, key: &str);
    /// How many times the key has been requeued since the last forget.
    fn retries(&self, key: &str) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped.
pub struct ItemExponentialBackoff {
    base: Duration,
    cap: Duration,
    failures: Mutex<FxHashMap<String, u32>>,
}

impl ItemExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl RateLimiter for ItemExponentialBackoff {
    fn when(&self, key: &str) -> Duration {
        let mut g = self.failures.lock().expect("limiter lock poisoned");
        let n = g.entry(key.to_string()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let delay = self
            .base
            .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        delay.min(self.cap)
    }

    fn forget(&self, key: &str) {
        self.failures.lock().expect("limiter lock poisoned").remove(key);
    }

    fn retries(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .expect("limiter lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Token bucket bounding overall requeue throughput, ignoring keys.
pub struct BucketLimiter {
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
}

impl BucketLimiter {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let per_second = NonZeroU32::new(per_second).unwrap_or(nonzero!(10u32));
        let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(100u32));
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self { limiter: DirectLimiter::direct(quota), clock: DefaultClock::default() }
    }
}

impl RateLimiter for BucketLimiter {
    fn when(&self, _key: &str) -> Duration {
        match self.limiter.check() {
            Ok(_) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        }
    }

    fn forget(&self, _key: &str) {}

    fn retries(&self, _key: &str) -> u32 {
        0
    }
}

/// Combines limiters by taking the worst delay and the worst retry count.
pub struct MaxOfRateLimiter(Vec<Box<dyn RateLimiter>>);

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self(limiters)
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        self.0.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for l in &self.0 {
            l.forget(key);
        }
    }

    fn retries(&self, key: &str) -> u32 {
        self.0.iter().map(|l| l.retries(key)).max().unwrap_or(0)
    }
}

pub fn default_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(1000))),
        Box::new(BucketLimiter::new(10, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let l = ItemExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(1000));
        assert_eq!(l.when("k"), Duration::from_millis(200));
        assert_eq!(l.when("k"), Duration::from_millis(400));
        assert_eq!(l.when("k"), Duration::from_millis(800));
        assert_eq!(l.retries("k"), 3);
        for _ in 0..40 {
            assert!(l.when("k") <= Duration::from_secs(1000));
        }
        assert_eq!(l.when("k"), Duration::from_secs(1000));
    }

    #[test]
    fn forget_clears_history() {
        let l = ItemExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(1000));
        l.when("k");
        l.when("k");
        l.forget("k");
        assert_eq!(l.retries("k"), 0);
        assert_eq!(l.when("k"), Duration::from_millis(200));
    }

    #[test]
    fn keys_back_off_independently() {
        let l = ItemExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(1000));
        l.when("a");
        l.when("a");
        assert_eq!(l.when("b"), Duration::from_millis(200));
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let l = BucketLimiter::new(1, 2);
        assert_eq!(l.when("x"), Duration::ZERO);
        assert_eq!(l.when("y"), Duration::ZERO);
        assert!(l.when("z") > Duration::ZERO);
    }

    #[test]
    fn max_of_takes_worst() {
        let l = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1))),
            Box::new(ItemExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(1))),
        ]);
        assert_eq!(l.when("k"), Duration::from_millis(50));
        assert_eq!(l.retries("k"), 1);
    }
}
