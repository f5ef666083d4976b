//! Requeue delay policies.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

/// Decides how long a failed item waits before it is redelivered.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`; counts as one failure.
    fn when(&self, item: &T) -> Duration;
    /// Reset the failure history of `item`.
    fn forget(&self, item: &T);
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }

    fn backoff(&self, failures: u32) -> Duration {
        if failures >= 64 {
            return self.max;
        }
        let nanos = self.base.as_nanos().saturating_mul(1u128 << failures);
        if nanos > self.max.as_nanos() {
            self.max
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl<T: Clone + Eq + Hash + Send> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        self.backoff(exp)
    }

    fn forget(&self, item: &T) { lock(&self.failures).remove(item); }

    fn num_requeues(&self, item: &T) -> u32 { lock(&self.failures).get(item).copied().unwrap_or(0) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all items: `qps` refill rate, `burst` capacity.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let refill = now.duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst) - 1.0;
        b.last = now;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Worst case of several limiters.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 { self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0) }
}

/// Backoff policy knobs. Defaults: 5 ms base, 1000 s cap, 10 qps, burst 100.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(1000), qps: 10.0, burst: 100 }
    }
}

impl RateLimitConfig {
    /// Read `PCL_QUEUE_BASE_DELAY_MS`, `PCL_QUEUE_MAX_DELAY_SECS`, `PCL_QUEUE_QPS`, `PCL_QUEUE_BURST`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let base_delay = std::env::var("PCL_QUEUE_BASE_DELAY_MS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.base_delay);
        let max_delay = std::env::var("PCL_QUEUE_MAX_DELAY_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.max_delay);
        let qps = std::env::var("PCL_QUEUE_QPS").ok().and_then(|s| s.parse::<f64>().ok()).unwrap_or(d.qps);
        let burst = std::env::var("PCL_QUEUE_BURST").ok().and_then(|s| s.parse::<u32>().ok()).unwrap_or(d.burst);
        Self { base_delay, max_delay: max_delay.max(base_delay), qps, burst }
    }
}

/// Per-item exponential backoff combined with an overall token bucket.
pub fn default_controller_rate_limiter<T>(cfg: &RateLimitConfig) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(cfg.base_delay, cfg.max_delay)),
        Box::new(BucketRateLimiter::new(cfg.qps, cfg.burst)),
    ])
}
