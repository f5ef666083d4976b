//! pcl queue: deduplicating work queue with per-item rate-limited retries.

#![forbid(unsafe_code)]

pub mod queue;
pub mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimitConfig, RateLimiter,
};
