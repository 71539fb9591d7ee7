//! State store configuration

use std::time::Duration;

/// Tuning knobs for the cache-first store.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// Maximum concurrently cached executions.
    pub cache_size: usize,
    /// Executions kept hot, exempt from eviction.
    pub warm_cache_size: usize,
    /// Executed-node count between checkpoints.
    pub checkpoint_interval: usize,
    /// Soft flush interval for dirty entries.
    pub persistence_delay: Duration,
    /// Force synchronous durable writes on completion events.
    pub write_through_critical: bool,
    /// Grace period before a finalized execution leaves the cache.
    pub removal_grace: Duration,
    /// Cadence of the eviction sweep.
    pub eviction_interval: Duration,
    /// Cadence of warm-cache recomputation from access frequency.
    pub warmup_interval: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            warm_cache_size: 20,
            checkpoint_interval: 10,
            persistence_delay: Duration::from_secs(5),
            write_through_critical: false,
            removal_grace: Duration::from_secs(10),
            eviction_interval: Duration::from_secs(30),
            warmup_interval: Duration::from_secs(300),
        }
    }
}

impl StateStoreConfig {
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_persistence_delay(mut self, delay: Duration) -> Self {
        self.persistence_delay = delay;
        self
    }

    pub fn with_write_through_critical(mut self, enabled: bool) -> Self {
        self.write_through_critical = enabled;
        self
    }

    pub fn with_removal_grace(mut self, grace: Duration) -> Self {
        self.removal_grace = grace;
        self
    }
}
