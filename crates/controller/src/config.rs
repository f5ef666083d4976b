use pcl_queue::RateLimitConfig;

/// Runtime knobs, read from `PCL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Capacity of each watch → informer channel.
    pub event_cap: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self { Self { workers: 2, event_cap: 2048, rate_limit: RateLimitConfig::default() } }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let workers = std::env::var("PCL_WORKERS").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(d.workers);
        let event_cap = std::env::var("PCL_EVENT_CAP").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(d.event_cap);
        Self { workers, event_cap, rate_limit: RateLimitConfig::from_env() }
    }
}
