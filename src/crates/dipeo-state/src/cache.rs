//! In-memory cache layer
//!
//! The cache is the primary read/write copy of every tracked execution.
//! Structural operations (insert, remove, lookup) go through a sharded map;
//! state mutation locks the individual entry. A warm set of frequently
//! accessed executions is exempt from eviction and recomputed periodically
//! from access-frequency counts.

use crate::models::{CacheEntry, StoreMetrics};
use dashmap::DashMap;
use dipeo_core::{ExecutionId, ExecutionState};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

type SharedEntry = Arc<Mutex<CacheEntry>>;

/// Cache operations, eviction policy, and warm-set bookkeeping.
pub struct CacheManager {
    entries: DashMap<ExecutionId, SharedEntry>,
    access_frequency: DashMap<ExecutionId, u64>,
    warm_ids: RwLock<HashSet<ExecutionId>>,
    cache_size: usize,
    warm_cache_size: usize,
    metrics: Arc<StoreMetrics>,
}

impl CacheManager {
    pub fn new(cache_size: usize, warm_cache_size: usize, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            entries: DashMap::new(),
            access_frequency: DashMap::new(),
            warm_ids: RwLock::new(HashSet::new()),
            cache_size,
            warm_cache_size,
            metrics,
        }
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.entries.contains_key(execution_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_warm(&self, execution_id: &str) -> bool {
        self.warm_ids.read().contains(execution_id)
    }

    /// Look up an entry, updating access metadata and hit metrics.
    pub async fn entry(&self, execution_id: &str) -> Option<SharedEntry> {
        let shared = match self.entries.get(execution_id) {
            Some(entry) => entry.value().clone(),
            None => {
                self.metrics.record_cache_miss();
                return None;
            }
        };

        shared.lock().await.touch();
        *self
            .access_frequency
            .entry(execution_id.to_string())
            .or_insert(0) += 1;
        self.metrics.record_cache_hit(self.is_warm(execution_id));
        Some(shared)
    }

    /// Insert an entry, returning the shared handle.
    pub fn insert(&self, execution_id: &str, entry: CacheEntry) -> SharedEntry {
        let shared = Arc::new(Mutex::new(entry));
        self.entries
            .insert(execution_id.to_string(), shared.clone());
        shared
    }

    pub fn remove(&self, execution_id: &str) -> Option<SharedEntry> {
        self.entries.remove(execution_id).map(|(_, entry)| entry)
    }

    pub fn mark_warm(&self, execution_id: &str) {
        self.warm_ids.write().insert(execution_id.to_string());
    }

    /// Pre-load states hydrated from persistence into the warm set.
    pub fn warm_with_states(&self, states: Vec<(ExecutionState, u64)>) {
        let mut warm = self.warm_ids.write();
        for (state, access_count) in states {
            let execution_id = state.id.clone();
            let mut entry = CacheEntry::persisted(state);
            entry.access_count = access_count;
            self.entries
                .insert(execution_id.clone(), Arc::new(Mutex::new(entry)));
            warm.insert(execution_id);
        }
    }

    /// Entries that would be evicted to bring the cache back to 90% of
    /// capacity: non-warm, least valued by `(access_count, last_access)`.
    /// The caller persists any dirty candidate before removal.
    pub async fn eviction_candidates(&self) -> Vec<(ExecutionId, SharedEntry)> {
        if self.entries.len() <= self.cache_size {
            return Vec::new();
        }
        let evict_count = self.entries.len() - self.cache_size * 9 / 10;

        // Snapshot first: entry locks must not be awaited while a map shard
        // guard is held.
        let snapshot: Vec<(ExecutionId, SharedEntry)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        let mut scored = Vec::new();
        for (execution_id, shared) in snapshot {
            if self.is_warm(&execution_id) {
                continue;
            }
            let (access_count, last_access) = {
                let entry = shared.lock().await;
                (entry.access_count, entry.last_access)
            };
            scored.push((access_count, last_access, execution_id, shared));
        }

        scored.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        scored
            .into_iter()
            .take(evict_count)
            .map(|(_, _, id, entry)| (id, entry))
            .collect()
    }

    /// Drop an evicted entry and count it.
    pub fn evict(&self, execution_id: &str) {
        if self.entries.remove(execution_id).is_some() {
            self.metrics.record_eviction();
        }
    }

    /// Recompute the warm set from access-frequency counts, then reset the
    /// counters for the next window.
    pub fn update_warm_cache(&self) {
        let mut counts: Vec<(ExecutionId, u64)> = self
            .access_frequency
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));

        let new_warm: HashSet<ExecutionId> = counts
            .into_iter()
            .take(self.warm_cache_size)
            .map(|(id, _)| id)
            .collect();

        debug!(warm = new_warm.len(), "warm cache recomputed");
        *self.warm_ids.write() = new_warm;
        self.access_frequency.clear();
    }

    /// Dirty entries, optionally restricted to those whose last write is
    /// older than `age_threshold`.
    pub async fn dirty_entries(
        &self,
        age_threshold: Option<Duration>,
    ) -> Vec<(ExecutionId, SharedEntry)> {
        let snapshot: Vec<(ExecutionId, SharedEntry)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        let mut dirty = Vec::new();
        for (execution_id, shared) in snapshot {
            let qualifies = {
                let entry = shared.lock().await;
                entry.dirty
                    && age_threshold
                        .map(|age| entry.last_write.elapsed() >= age)
                        .unwrap_or(true)
            };
            if qualifies {
                dirty.push((execution_id, shared));
            }
        }
        dirty
    }
}
