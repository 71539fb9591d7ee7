//! Data models for the cache-first store

use dipeo_core::ExecutionState;
use parking_lot::Mutex;
use std::time::Instant;

/// One cached execution with the metadata eviction and checkpointing need.
#[derive(Debug)]
pub struct CacheEntry {
    pub state: ExecutionState,
    pub last_access: Instant,
    pub last_write: Instant,
    pub access_count: u64,
    pub dirty: bool,
    pub persisted: bool,
    pub checkpoint_count: u32,
}

impl CacheEntry {
    pub fn new(state: ExecutionState) -> Self {
        let now = Instant::now();
        Self {
            state,
            last_access: now,
            last_write: now,
            access_count: 0,
            dirty: false,
            persisted: false,
            checkpoint_count: 0,
        }
    }

    pub fn dirty(state: ExecutionState) -> Self {
        let mut entry = Self::new(state);
        entry.dirty = true;
        entry
    }

    /// Entry hydrated from the database: clean and already durable.
    pub fn persisted(state: ExecutionState) -> Self {
        let mut entry = Self::new(state);
        entry.persisted = true;
        entry
    }

    /// Update access time and count.
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }

    /// Mark the entry as carrying unpersisted changes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.last_write = Instant::now();
    }

    /// Mark the entry durable after a successful persist.
    pub fn mark_persisted(&mut self) {
        self.dirty = false;
        self.persisted = true;
    }
}

/// A queued persistence point for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceCheckpoint {
    pub execution_id: String,
    pub node_count: usize,
    pub is_final: bool,
}

impl PersistenceCheckpoint {
    pub fn new(execution_id: impl Into<String>, node_count: usize) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_count,
            is_final: false,
        }
    }

    pub fn final_for(execution_id: impl Into<String>, node_count: usize) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_count,
            is_final: true,
        }
    }
}

/// Point-in-time view of the store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub warm_cache_hits: u64,
    pub db_reads: u64,
    pub db_writes: u64,
    pub checkpoints: u64,
    pub cache_evictions: u64,
}

impl StoreMetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64 * 100.0
        }
    }
}

/// Shared counters for cache and persistence behavior.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    inner: Mutex<StoreMetricsSnapshot>,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self, warm: bool) {
        let mut m = self.inner.lock();
        if warm {
            m.warm_cache_hits += 1;
        } else {
            m.cache_hits += 1;
        }
    }

    pub fn record_cache_miss(&self) {
        self.inner.lock().cache_misses += 1;
    }

    pub fn record_db_read(&self) {
        self.inner.lock().db_reads += 1;
    }

    pub fn record_db_write(&self) {
        self.inner.lock().db_writes += 1;
    }

    pub fn record_checkpoint(&self) {
        self.inner.lock().checkpoints += 1;
    }

    pub fn record_eviction(&self) {
        self.inner.lock().cache_evictions += 1;
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        self.inner.lock().clone()
    }
}
