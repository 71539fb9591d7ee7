//! Cache-first state store
//!
//! The facade tying the cache and persistence layers together. All reads
//! and writes hit the cache; durability comes from checkpoints drained by a
//! background worker, soft flushes of aged dirty entries, and optional
//! write-through on critical events.
//!
//! The store consumes domain events as an [`EventSink`]. Events for
//! executions it does not track are dropped, with one exception:
//! `EXECUTION_COMPLETED` always gets a chance to finalize state, hydrating
//! from the database if needed. Every applied event is recorded in the
//! transitions table keyed by `(execution_id, seq)`, so re-delivery is a
//! no-op.

use crate::cache::CacheManager;
use crate::config::StateStoreConfig;
use crate::error::{Result, StateStoreError};
use crate::models::{CacheEntry, PersistenceCheckpoint, StoreMetrics, StoreMetricsSnapshot};
use crate::persistence::{ListFilter, PersistenceManager};
use async_trait::async_trait;
use chrono::Utc;
use dipeo_core::{
    DomainEvent, EventSink, EventType, ExecutionState, LlmUsage, NodeState, Status, WireEnvelope,
};
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Durable execution state with an in-memory primary copy.
pub struct CacheFirstStateStore {
    cache: Arc<CacheManager>,
    persistence: Arc<PersistenceManager>,
    config: StateStoreConfig,
    metrics: Arc<StoreMetrics>,
    checkpoint_tx: mpsc::UnboundedSender<PersistenceCheckpoint>,
    running: Arc<AtomicBool>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl CacheFirstStateStore {
    /// Connect, initialize the schema, warm the cache, and start the
    /// background workers.
    pub async fn open(database_url: &str, config: StateStoreConfig) -> Result<Arc<Self>> {
        let metrics = Arc::new(StoreMetrics::new());
        let persistence =
            Arc::new(PersistenceManager::connect(database_url, metrics.clone()).await?);
        persistence.init_schema().await?;

        let cache = Arc::new(CacheManager::new(
            config.cache_size,
            config.warm_cache_size,
            metrics.clone(),
        ));
        let warm_states = persistence.load_warm_states(config.warm_cache_size).await?;
        if !warm_states.is_empty() {
            info!(count = warm_states.len(), "cache warmed from database");
            cache.warm_with_states(warm_states);
        }

        let (checkpoint_tx, checkpoint_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let store = Arc::new(Self {
            cache: cache.clone(),
            persistence: persistence.clone(),
            config: config.clone(),
            metrics: metrics.clone(),
            checkpoint_tx,
            running: running.clone(),
            workers: SyncMutex::new(Vec::new()),
        });

        let mut workers = Vec::new();
        workers.push(tokio::spawn(Self::persistence_loop(
            cache.clone(),
            persistence.clone(),
            metrics.clone(),
            checkpoint_rx,
            config.persistence_delay,
            running.clone(),
        )));
        workers.push(tokio::spawn(Self::eviction_loop(
            cache.clone(),
            persistence.clone(),
            config.eviction_interval,
            running.clone(),
        )));
        workers.push(tokio::spawn(Self::warmup_loop(
            cache,
            config.warmup_interval,
            running,
        )));
        *store.workers.lock() = workers;

        Ok(store)
    }

    /// Flush all dirty entries and stop the background workers.
    pub async fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        for (execution_id, shared) in self.cache.dirty_entries(None).await {
            let mut entry = shared.lock().await;
            if let Err(e) = self
                .persistence
                .persist_entry(&execution_id, &mut entry, false)
                .await
            {
                warn!(execution_id = %execution_id, error = %e, "flush on shutdown failed");
            }
        }

        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }

        let snapshot = self.metrics.snapshot();
        info!(
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            db_writes = snapshot.db_writes,
            checkpoints = snapshot.checkpoints,
            evictions = snapshot.cache_evictions,
            "state store stopped"
        );
        Ok(())
    }

    // ----- event application -------------------------------------------

    /// Apply one domain event to durable state, idempotently.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<()> {
        let execution_id = event.scope.execution_id.clone();

        // Events for executions we are not tracking are sub-diagram noise,
        // except the completion event which must finalize state.
        if !self.cache.contains(&execution_id) {
            if event.event_type != EventType::ExecutionCompleted {
                return Ok(());
            }
            match self.persistence.load_state(&execution_id).await? {
                Some(state) => {
                    let mut entry = CacheEntry::persisted(state);
                    entry.mark_dirty();
                    self.cache.insert(&execution_id, entry);
                }
                None => {
                    warn!(
                        execution_id = %execution_id,
                        "completion event for unknown execution, no state anywhere"
                    );
                    return Ok(());
                }
            }
        }

        let payload = json!({
            "event_type": event.event_type,
            "data": event.payload,
        });
        let is_new = self
            .persistence
            .record_transition(
                &execution_id,
                event.scope.node_id.as_deref(),
                &event.event_type.to_string(),
                event.seq,
                &payload,
            )
            .await?;
        if !is_new {
            debug!(execution_id = %execution_id, seq = event.seq, "duplicate event skipped");
            return Ok(());
        }

        let node_id = event.scope.node_id.clone();
        match event.event_type {
            EventType::ExecutionStarted => {
                self.update_status(&execution_id, Status::Running, None).await?;
            }
            EventType::NodeStarted => {
                if let Some(node_id) = node_id {
                    self.update_node_status(&execution_id, &node_id, Status::Running, None)
                        .await?;
                    if let Some(iteration) =
                        event.payload.get("iteration").and_then(Value::as_u64)
                    {
                        self.with_entry(&execution_id, |entry| {
                            entry
                                .state
                                .exec_counts
                                .insert(node_id.clone(), iteration as u32);
                            entry.mark_dirty();
                        })
                        .await?;
                    }
                }
            }
            EventType::NodeCompleted => {
                if let Some(node_id) = node_id {
                    self.update_node_status(&execution_id, &node_id, Status::Completed, None)
                        .await?;
                    if let Some(output) = event.payload_output() {
                        self.update_node_output(
                            &execution_id,
                            &node_id,
                            output,
                            event.payload_llm_usage(),
                        )
                        .await?;
                    }
                    self.maybe_checkpoint(&execution_id).await?;
                    if self.config.write_through_critical {
                        self.persist_critical(&execution_id).await?;
                    }
                }
            }
            EventType::NodeSkipped => {
                if let Some(node_id) = node_id {
                    let reason = event
                        .payload
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(String::from);
                    self.update_node_status(&execution_id, &node_id, Status::Skipped, reason)
                        .await?;
                }
            }
            EventType::NodeError => {
                if let Some(node_id) = node_id {
                    self.update_node_status(
                        &execution_id,
                        &node_id,
                        Status::Failed,
                        event.payload_error(),
                    )
                    .await?;
                }
            }
            EventType::ExecutionFailed => {
                self.update_status(&execution_id, Status::Failed, event.payload_error())
                    .await?;
            }
            EventType::ExecutionCompleted => {
                let status = event.payload_status().unwrap_or(Status::Completed);
                self.update_status(&execution_id, status, event.payload_error())
                    .await?;
                if self.config.write_through_critical {
                    self.persist_critical(&execution_id).await?;
                }
                self.schedule_removal(&execution_id);
            }
        }
        Ok(())
    }

    // ----- read/update API ---------------------------------------------

    /// Create a new execution (cache-only until the first checkpoint).
    pub async fn create_execution(
        &self,
        execution_id: &str,
        diagram_id: Option<String>,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionState> {
        let state = ExecutionState::new(execution_id, diagram_id, variables);
        self.cache.insert(execution_id, CacheEntry::dirty(state.clone()));
        debug!(execution_id, "execution created in cache");
        Ok(state)
    }

    /// Replace the cached state (deferred database write).
    pub async fn save_state(&self, state: ExecutionState) -> Result<()> {
        let execution_id = state.id.clone();
        match self.cache.entry(&execution_id).await {
            Some(shared) => {
                let mut entry = shared.lock().await;
                entry.state = state;
                entry.mark_dirty();
            }
            None => {
                self.cache.insert(&execution_id, CacheEntry::dirty(state));
            }
        }
        self.maybe_checkpoint(&execution_id).await
    }

    /// Cache-first read; misses hydrate from the database and bump the
    /// access counter used for warm-cache selection.
    pub async fn get_state(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        if let Some(shared) = self.cache.entry(execution_id).await {
            return Ok(Some(shared.lock().await.state.clone()));
        }

        let Some(state) = self.persistence.load_state(execution_id).await? else {
            return Ok(None);
        };
        self.cache.insert(execution_id, CacheEntry::persisted(state.clone()));
        self.persistence.update_access_tracking(execution_id).await?;
        Ok(Some(state))
    }

    /// Cache-only read, no database fallback.
    pub async fn get_state_from_cache(&self, execution_id: &str) -> Option<ExecutionState> {
        let shared = self.cache.entry(execution_id).await?;
        let entry = shared.lock().await;
        Some(entry.state.clone())
    }

    pub async fn update_status(
        &self,
        execution_id: &str,
        status: Status,
        error: Option<String>,
    ) -> Result<()> {
        let final_count = self
            .with_entry(execution_id, |entry| {
                if status.is_terminal() {
                    entry.state.finish(status, error);
                } else {
                    entry.state.status = status;
                    entry.state.error = error;
                }
                entry.mark_dirty();
                status
                    .is_terminal()
                    .then(|| entry.state.executed_nodes.len())
            })
            .await?;

        if let Some(node_count) = final_count {
            self.enqueue_checkpoint(PersistenceCheckpoint::final_for(execution_id, node_count));
        }
        Ok(())
    }

    pub async fn update_node_status(
        &self,
        execution_id: &str,
        node_id: &str,
        status: Status,
        error: Option<String>,
    ) -> Result<()> {
        self.with_entry(execution_id, |entry| {
            let now = Utc::now();
            let state = &mut entry.state;

            // Keep execution order even when events arrive before the
            // engine-side save.
            if !state.executed_nodes.iter().any(|n| n == node_id) {
                state.executed_nodes.push(node_id.to_string());
            }

            let node_state = state
                .node_states
                .entry(node_id.to_string())
                .or_insert_with(NodeState::default);
            node_state.status = Some(status);
            match status {
                Status::Running => node_state.started_at = Some(now),
                Status::Completed | Status::Failed | Status::Skipped => {
                    node_state.ended_at = Some(now)
                }
                _ => {}
            }
            if let Some(error) = error {
                node_state.error = Some(error);
            }
            entry.mark_dirty();
        })
        .await
    }

    pub async fn update_node_output(
        &self,
        execution_id: &str,
        node_id: &str,
        output: WireEnvelope,
        llm_usage: Option<LlmUsage>,
    ) -> Result<()> {
        self.with_entry(execution_id, |entry| {
            entry.state.node_outputs.insert(node_id.to_string(), output);
            entry.mark_dirty();
        })
        .await?;

        if let Some(usage) = llm_usage {
            self.add_llm_usage(execution_id, usage).await?;
        }
        Ok(())
    }

    pub async fn update_variables(
        &self,
        execution_id: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.with_entry(execution_id, |entry| {
            entry.state.variables.extend(variables);
            entry.mark_dirty();
        })
        .await
    }

    /// Accumulate token usage, preserving `total = input + output`.
    pub async fn add_llm_usage(&self, execution_id: &str, usage: LlmUsage) -> Result<()> {
        self.with_entry(execution_id, |entry| {
            entry.state.llm_usage.add(&usage);
            entry.mark_dirty();
        })
        .await
    }

    pub async fn list_executions(&self, filter: &ListFilter) -> Result<Vec<ExecutionState>> {
        self.persistence.list_executions(filter).await
    }

    pub async fn cleanup_older_than_days(&self, days: i64) -> Result<u64> {
        self.persistence
            .cleanup_older_than(Utc::now() - chrono::Duration::days(days))
            .await
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    // ----- internals ----------------------------------------------------

    async fn with_entry<R>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut CacheEntry) -> R,
    ) -> Result<R> {
        let shared = match self.cache.entry(execution_id).await {
            Some(shared) => shared,
            None => {
                let state = self
                    .persistence
                    .load_state(execution_id)
                    .await?
                    .ok_or_else(|| StateStoreError::NotFound(execution_id.to_string()))?;
                let shared = self.cache.insert(execution_id, CacheEntry::persisted(state));
                self.persistence.update_access_tracking(execution_id).await?;
                shared
            }
        };
        let mut entry = shared.lock().await;
        Ok(f(&mut entry))
    }

    /// Enqueue a checkpoint when the executed-node count crosses the
    /// interval.
    async fn maybe_checkpoint(&self, execution_id: &str) -> Result<()> {
        let node_count = self
            .with_entry(execution_id, |entry| entry.state.executed_nodes.len())
            .await?;
        if node_count > 0 && node_count % self.config.checkpoint_interval == 0 {
            self.enqueue_checkpoint(PersistenceCheckpoint::new(execution_id, node_count));
        }
        Ok(())
    }

    fn enqueue_checkpoint(&self, checkpoint: PersistenceCheckpoint) {
        // Send failure means the worker is gone; the shutdown flush covers
        // remaining dirty state.
        let _ = self.checkpoint_tx.send(checkpoint);
    }

    /// Immediate durable write with full sync for critical events.
    async fn persist_critical(&self, execution_id: &str) -> Result<()> {
        let Some(shared) = self.cache.entry(execution_id).await else {
            return Ok(());
        };
        let mut entry = shared.lock().await;
        self.persistence
            .persist_entry(execution_id, &mut entry, true)
            .await?;
        self.metrics.record_checkpoint();
        Ok(())
    }

    /// Drop a finalized execution from the cache after the grace period.
    fn schedule_removal(&self, execution_id: &str) {
        let cache = self.cache.clone();
        let execution_id = execution_id.to_string();
        let grace = self.config.removal_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            cache.remove(&execution_id);
            debug!(execution_id = %execution_id, "finalized execution left the cache");
        });
    }

    // ----- background workers ------------------------------------------

    async fn persistence_loop(
        cache: Arc<CacheManager>,
        persistence: Arc<PersistenceManager>,
        metrics: Arc<StoreMetrics>,
        mut checkpoint_rx: mpsc::UnboundedReceiver<PersistenceCheckpoint>,
        persistence_delay: Duration,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::SeqCst) {
            match tokio::time::timeout(persistence_delay, checkpoint_rx.recv()).await {
                Ok(Some(checkpoint)) => {
                    Self::handle_checkpoint(&cache, &persistence, &metrics, checkpoint).await;
                }
                Ok(None) => break,
                // Idle: flush dirty entries older than the delay.
                Err(_) => {
                    Self::flush_aged_dirty(&cache, &persistence, persistence_delay).await;
                }
            }
        }
    }

    async fn handle_checkpoint(
        cache: &CacheManager,
        persistence: &PersistenceManager,
        metrics: &StoreMetrics,
        checkpoint: PersistenceCheckpoint,
    ) {
        let Some(shared) = cache.entry(&checkpoint.execution_id).await else {
            return;
        };
        let mut entry = shared.lock().await;
        if !entry.dirty && !checkpoint.is_final {
            return;
        }
        match persistence
            .persist_entry(&checkpoint.execution_id, &mut entry, false)
            .await
        {
            Ok(()) => {
                entry.checkpoint_count += 1;
                metrics.record_checkpoint();
            }
            // Entry stays dirty; a later checkpoint retries.
            Err(e) => warn!(
                execution_id = %checkpoint.execution_id,
                error = %e,
                "checkpoint persist failed"
            ),
        }
    }

    async fn flush_aged_dirty(
        cache: &CacheManager,
        persistence: &PersistenceManager,
        age: Duration,
    ) {
        for (execution_id, shared) in cache.dirty_entries(Some(age)).await {
            let mut entry = shared.lock().await;
            if let Err(e) = persistence
                .persist_entry(&execution_id, &mut entry, false)
                .await
            {
                warn!(execution_id = %execution_id, error = %e, "delayed persist failed");
            }
        }
    }

    async fn eviction_loop(
        cache: Arc<CacheManager>,
        persistence: Arc<PersistenceManager>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
            for (execution_id, shared) in cache.eviction_candidates().await {
                let mut entry = shared.lock().await;
                if entry.dirty {
                    // Never drop unpersisted state.
                    if let Err(e) = persistence
                        .persist_entry(&execution_id, &mut entry, false)
                        .await
                    {
                        warn!(
                            execution_id = %execution_id,
                            error = %e,
                            "persist before eviction failed, keeping entry"
                        );
                        continue;
                    }
                }
                drop(entry);
                cache.evict(&execution_id);
            }
        }
    }

    async fn warmup_loop(cache: Arc<CacheManager>, interval: Duration, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
            cache.update_warm_cache();
        }
    }
}

#[async_trait]
impl EventSink for CacheFirstStateStore {
    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.handle_event(&event).await {
            error!(
                execution_id = %event.scope.execution_id,
                event_type = %event.event_type,
                error = %e,
                "event application failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Arc<CacheFirstStateStore> {
        CacheFirstStateStore::open(
            "sqlite::memory:",
            StateStoreConfig::default()
                .with_checkpoint_interval(2)
                .with_persistence_delay(Duration::from_millis(50))
                .with_removal_grace(Duration::from_millis(50)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store().await;
        store
            .create_execution("exec-1", Some("diag".into()), BTreeMap::new())
            .await
            .unwrap();

        let state = store.get_state("exec-1").await.unwrap().unwrap();
        assert_eq!(state.status, Status::Pending);
        assert_eq!(state.diagram_id.as_deref(), Some("diag"));
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_execution_events_are_dropped() {
        let store = store().await;
        let event = DomainEvent::node_started("ghost", "a", 1, 1);
        store.handle_event(&event).await.unwrap();

        assert!(store.get_state("ghost").await.unwrap().is_none());
        assert_eq!(
            store.persistence().latest_sequence("ghost").await.unwrap(),
            0
        );
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_events_apply_once() {
        let store = store().await;
        store
            .create_execution("exec-1", None, BTreeMap::new())
            .await
            .unwrap();

        let event = DomainEvent::node_started("exec-1", "a", 1, 1);
        store.handle_event(&event).await.unwrap();
        store.handle_event(&event).await.unwrap();

        let state = store.get_state("exec-1").await.unwrap().unwrap();
        assert_eq!(state.executed_nodes, vec!["a".to_string()]);
        assert_eq!(state.exec_counts.get("a"), Some(&1));
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_status_sets_ended_at() {
        let store = store().await;
        store
            .create_execution("exec-1", None, BTreeMap::new())
            .await
            .unwrap();
        store
            .update_status("exec-1", Status::Completed, None)
            .await
            .unwrap();

        let state = store.get_state("exec-1").await.unwrap().unwrap();
        assert!(state.ended_at.is_some());
        assert!(!state.is_active);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_llm_usage_accumulates() {
        let store = store().await;
        store
            .create_execution("exec-1", None, BTreeMap::new())
            .await
            .unwrap();
        store
            .add_llm_usage("exec-1", LlmUsage::new(10, 5))
            .await
            .unwrap();
        store
            .add_llm_usage("exec-1", LlmUsage::new(3, 2))
            .await
            .unwrap();

        let state = store.get_state("exec-1").await.unwrap().unwrap();
        assert_eq!(state.llm_usage.input, 13);
        assert_eq!(state.llm_usage.output, 7);
        assert_eq!(state.llm_usage.total, 20);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_for_missing_execution_is_not_found() {
        let store = store().await;
        let result = store.update_status("ghost", Status::Running, None).await;
        assert!(matches!(result, Err(StateStoreError::NotFound(_))));
        store.shutdown().await.unwrap();
    }
}
