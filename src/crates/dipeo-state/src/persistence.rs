//! SQLite persistence layer
//!
//! The system of record behind the cache. One serialized connection, WAL
//! journal mode, `synchronous=NORMAL` in steady state and `FULL` around
//! critical writes. State persists as a single upsert per execution;
//! transitions carry a unique `(execution_id, seq)` constraint that gives
//! event application its idempotency.

use crate::error::{Result, StateStoreError};
use crate::models::{CacheEntry, StoreMetrics};
use chrono::{DateTime, Utc};
use dipeo_core::{ExecutionState, LlmUsage, NodeId, NodeState, Status, WireEnvelope};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        diagram_id TEXT,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        node_states TEXT NOT NULL,
        node_outputs TEXT NOT NULL,
        llm_usage TEXT NOT NULL,
        error TEXT,
        variables TEXT NOT NULL,
        exec_counts TEXT NOT NULL DEFAULT '{}',
        executed_nodes TEXT NOT NULL DEFAULT '[]',
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        access_count INTEGER DEFAULT 0,
        last_accessed TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_status ON executions(status)",
    "CREATE INDEX IF NOT EXISTS idx_started_at ON executions(started_at)",
    "CREATE INDEX IF NOT EXISTS idx_diagram_id ON executions(diagram_id)",
    "CREATE INDEX IF NOT EXISTS idx_access_count ON executions(access_count DESC)",
    "CREATE INDEX IF NOT EXISTS idx_last_accessed ON executions(last_accessed DESC)",
    "CREATE TABLE IF NOT EXISTS transitions (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        node_id TEXT,
        phase TEXT NOT NULL,
        seq INTEGER NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_exec_seq ON transitions(execution_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_exec_transitions ON transitions(execution_id)",
    "CREATE INDEX IF NOT EXISTS idx_transition_created ON transitions(created_at DESC)",
];

const UPSERT_EXECUTION: &str = "
    INSERT INTO executions
        (execution_id, status, diagram_id, started_at, ended_at,
         node_states, node_outputs, llm_usage, error, variables,
         exec_counts, executed_nodes, access_count, last_accessed)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(execution_id) DO UPDATE SET
        status = excluded.status,
        ended_at = excluded.ended_at,
        node_states = excluded.node_states,
        node_outputs = excluded.node_outputs,
        llm_usage = excluded.llm_usage,
        error = excluded.error,
        variables = excluded.variables,
        exec_counts = excluded.exec_counts,
        executed_nodes = excluded.executed_nodes,
        access_count = excluded.access_count,
        last_accessed = excluded.last_accessed";

const SELECT_STATE: &str = "
    SELECT execution_id, status, diagram_id, started_at, ended_at,
           node_states, node_outputs, llm_usage, error, variables,
           exec_counts, executed_nodes, access_count
    FROM executions";

/// Filters for listing persisted executions.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub diagram_id: Option<String>,
    pub status: Option<Status>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl ListFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_diagram_id(mut self, diagram_id: impl Into<String>) -> Self {
        self.diagram_id = Some(diagram_id.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Database operations for execution state and transitions.
pub struct PersistenceManager {
    pool: SqlitePool,
    metrics: Arc<StoreMetrics>,
}

impl PersistenceManager {
    /// Connect and configure the database. `database_url` accepts the
    /// usual sqlite forms (`sqlite:path/to.db`, `sqlite::memory:`).
    pub async fn connect(database_url: &str, metrics: Arc<StoreMetrics>) -> Result<Self> {
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));
        // WAL needs a file behind it; in-memory databases keep their own
        // journal mode.
        if !database_url.contains(":memory:") {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // A single connection serializes database access.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        info!(database_url, "state database connected");
        Ok(Self { pool, metrics })
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a cache entry in a single upsert. With `use_full_sync`, the
    /// write happens under `synchronous=FULL` for enhanced durability.
    pub async fn persist_entry(
        &self,
        execution_id: &str,
        entry: &mut CacheEntry,
        use_full_sync: bool,
    ) -> Result<()> {
        let state = &entry.state;
        let query = sqlx::query(UPSERT_EXECUTION)
            .bind(&state.id)
            .bind(state.status.as_str())
            .bind(&state.diagram_id)
            .bind(state.started_at.to_rfc3339())
            .bind(state.ended_at.map(|t| t.to_rfc3339()))
            .bind(serde_json::to_string(&state.node_states)?)
            .bind(serde_json::to_string(&state.node_outputs)?)
            .bind(serde_json::to_string(&state.llm_usage)?)
            .bind(&state.error)
            .bind(serde_json::to_string(&state.variables)?)
            .bind(serde_json::to_string(&state.exec_counts)?)
            .bind(serde_json::to_string(&state.executed_nodes)?)
            .bind(entry.access_count as i64)
            .bind(Utc::now().to_rfc3339());

        if use_full_sync {
            let mut conn = self.pool.acquire().await?;
            sqlx::query("PRAGMA synchronous=FULL")
                .execute(&mut *conn)
                .await?;
            let result = query.execute(&mut *conn).await;
            sqlx::query("PRAGMA synchronous=NORMAL")
                .execute(&mut *conn)
                .await?;
            result?;
        } else {
            query.execute(&self.pool).await?;
        }

        self.metrics.record_db_write();
        entry.mark_persisted();
        debug!(execution_id, use_full_sync, "state persisted");
        Ok(())
    }

    pub async fn load_state(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        let row = sqlx::query(&format!("{SELECT_STATE} WHERE execution_id = ?"))
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        self.metrics.record_db_read();

        row.map(|row| state_from_row(&row)).transpose()
    }

    /// Frequently accessed active executions for cache warming.
    pub async fn load_warm_states(&self, limit: usize) -> Result<Vec<(ExecutionState, u64)>> {
        let rows = sqlx::query(&format!(
            "{SELECT_STATE} WHERE status IN (?, ?)
             ORDER BY access_count DESC, last_accessed DESC LIMIT ?"
        ))
        .bind(Status::Running.as_str())
        .bind(Status::Pending.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        self.metrics.record_db_read();

        rows.iter()
            .map(|row| {
                let access_count: i64 = row.try_get("access_count")?;
                Ok((state_from_row(row)?, access_count.max(0) as u64))
            })
            .collect()
    }

    /// Bump access tracking used for warm-cache selection.
    pub async fn update_access_tracking(&self, execution_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE executions
             SET access_count = access_count + 1, last_accessed = ?
             WHERE execution_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        self.metrics.record_db_write();
        Ok(())
    }

    /// Record an applied event. Returns false when `(execution_id, seq)`
    /// was already recorded, signalling a duplicate delivery.
    pub async fn record_transition(
        &self,
        execution_id: &str,
        node_id: Option<&str>,
        phase: &str,
        seq: u64,
        payload: &Value,
    ) -> Result<bool> {
        let transition_id = format!("{execution_id}:{seq}");
        let result = sqlx::query(
            "INSERT INTO transitions (id, execution_id, node_id, phase, seq, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition_id)
        .bind(execution_id)
        .bind(node_id)
        .bind(phase)
        .bind(seq as i64)
        .bind(serde_json::to_string(payload)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                self.metrics.record_db_write();
                Ok(true)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                debug!(transition_id, "duplicate transition ignored");
                Ok(false)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Highest sequence number applied for an execution, 0 if none.
    pub async fn latest_sequence(&self, execution_id: &str) -> Result<u64> {
        let row = sqlx::query("SELECT MAX(seq) AS max_seq FROM transitions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_one(&self.pool)
            .await?;
        self.metrics.record_db_read();

        let max_seq: Option<i64> = row.try_get("max_seq")?;
        Ok(max_seq.unwrap_or(0).max(0) as u64)
    }

    pub async fn list_executions(&self, filter: &ListFilter) -> Result<Vec<ExecutionState>> {
        let mut query = String::from(SELECT_STATE);
        let mut conditions = Vec::new();
        if filter.diagram_id.is_some() {
            conditions.push("diagram_id = ?");
        }
        if filter.status.is_some() {
            conditions.push("status = ?");
        }
        if filter.started_after.is_some() {
            conditions.push("started_at >= ?");
        }
        if filter.started_before.is_some() {
            conditions.push("started_at <= ?");
        }
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");

        let mut prepared = sqlx::query(&query);
        if let Some(diagram_id) = &filter.diagram_id {
            prepared = prepared.bind(diagram_id);
        }
        if let Some(status) = filter.status {
            prepared = prepared.bind(status.as_str());
        }
        if let Some(after) = filter.started_after {
            prepared = prepared.bind(after.to_rfc3339());
        }
        if let Some(before) = filter.started_before {
            prepared = prepared.bind(before.to_rfc3339());
        }
        let rows = prepared
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;
        self.metrics.record_db_read();

        rows.iter().map(state_from_row).collect()
    }

    /// Delete executions started before the cutoff and reclaim space.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM executions WHERE started_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        self.metrics.record_db_write();
        Ok(result.rows_affected())
    }

    pub async fn count_executions(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM executions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn parse_timestamp(execution_id: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StateStoreError::Corrupt {
            execution_id: execution_id.to_string(),
            detail: format!("bad timestamp '{raw}': {e}"),
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(
    execution_id: &str,
    column: &str,
    raw: &str,
) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| StateStoreError::Corrupt {
        execution_id: execution_id.to_string(),
        detail: format!("bad {column}: {e}"),
    })
}

fn state_from_row(row: &SqliteRow) -> Result<ExecutionState> {
    let execution_id: String = row.try_get("execution_id")?;
    let status_raw: String = row.try_get("status")?;
    let status = Status::from_str(&status_raw).map_err(|detail| StateStoreError::Corrupt {
        execution_id: execution_id.clone(),
        detail,
    })?;

    let started_at_raw: String = row.try_get("started_at")?;
    let ended_at_raw: Option<String> = row.try_get("ended_at")?;

    let node_states_raw: String = row.try_get("node_states")?;
    let node_outputs_raw: String = row.try_get("node_outputs")?;
    let llm_usage_raw: String = row.try_get("llm_usage")?;
    let variables_raw: String = row.try_get("variables")?;
    let exec_counts_raw: String = row.try_get("exec_counts")?;
    let executed_nodes_raw: String = row.try_get("executed_nodes")?;

    let node_states: BTreeMap<NodeId, NodeState> =
        parse_json(&execution_id, "node_states", &node_states_raw)?;
    let node_outputs: BTreeMap<NodeId, WireEnvelope> =
        parse_json(&execution_id, "node_outputs", &node_outputs_raw)?;
    let llm_usage: LlmUsage = parse_json(&execution_id, "llm_usage", &llm_usage_raw)?;
    let variables: BTreeMap<String, Value> =
        parse_json(&execution_id, "variables", &variables_raw)?;
    let exec_counts: BTreeMap<NodeId, u32> =
        parse_json(&execution_id, "exec_counts", &exec_counts_raw)?;
    let executed_nodes: Vec<NodeId> =
        parse_json(&execution_id, "executed_nodes", &executed_nodes_raw)?;

    let started_at = parse_timestamp(&execution_id, &started_at_raw)?;
    let ended_at = ended_at_raw
        .map(|raw| parse_timestamp(&execution_id, &raw))
        .transpose()?;

    Ok(ExecutionState {
        is_active: status.is_active(),
        id: execution_id,
        status,
        diagram_id: row.try_get("diagram_id")?,
        started_at,
        ended_at,
        node_states,
        node_outputs,
        llm_usage,
        error: row.try_get("error")?,
        variables,
        exec_counts,
        executed_nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dipeo_core::Envelope;
    use serde_json::json;

    async fn manager() -> PersistenceManager {
        let m = PersistenceManager::connect("sqlite::memory:", Arc::new(StoreMetrics::new()))
            .await
            .unwrap();
        m.init_schema().await.unwrap();
        m
    }

    fn sample_state(id: &str) -> ExecutionState {
        let mut state = ExecutionState::new(id, Some("diag-1".into()), BTreeMap::new());
        state.status = Status::Running;
        state.variables.insert("x".into(), json!(5));
        state
            .node_outputs
            .insert("a".into(), Envelope::text("a", "out").into());
        state.record_executed("a");
        state
    }

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let db = manager().await;
        let state = sample_state("exec-1");
        let mut entry = CacheEntry::dirty(state.clone());

        db.persist_entry("exec-1", &mut entry, false).await.unwrap();
        assert!(!entry.dirty);
        assert!(entry.persisted);

        let loaded = db.load_state("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_persist_is_an_upsert() {
        let db = manager().await;
        let mut entry = CacheEntry::dirty(sample_state("exec-1"));
        db.persist_entry("exec-1", &mut entry, false).await.unwrap();

        entry.state.finish(Status::Completed, None);
        entry.mark_dirty();
        db.persist_entry("exec-1", &mut entry, false).await.unwrap();

        assert_eq!(db.count_executions().await.unwrap(), 1);
        let loaded = db.load_state("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::Completed);
        assert!(loaded.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_full_sync_write() {
        let db = manager().await;
        let mut entry = CacheEntry::dirty(sample_state("exec-1"));
        db.persist_entry("exec-1", &mut entry, true).await.unwrap();
        assert!(db.load_state("exec-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_state_is_none() {
        let db = manager().await;
        assert!(db.load_state("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_dedup() {
        let db = manager().await;
        let payload = json!({"event_type": "NODE_COMPLETED"});

        assert!(db
            .record_transition("exec-1", Some("a"), "NODE_COMPLETED", 3, &payload)
            .await
            .unwrap());
        assert!(!db
            .record_transition("exec-1", Some("a"), "NODE_COMPLETED", 3, &payload)
            .await
            .unwrap());
        // A different execution may reuse the same seq.
        assert!(db
            .record_transition("exec-2", Some("a"), "NODE_COMPLETED", 3, &payload)
            .await
            .unwrap());

        assert_eq!(db.latest_sequence("exec-1").await.unwrap(), 3);
        assert_eq!(db.latest_sequence("ghost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_with_filters() {
        let db = manager().await;
        let mut running = CacheEntry::dirty(sample_state("exec-1"));
        db.persist_entry("exec-1", &mut running, false).await.unwrap();

        let mut completed_state = sample_state("exec-2");
        completed_state.finish(Status::Completed, None);
        let mut completed = CacheEntry::dirty(completed_state);
        db.persist_entry("exec-2", &mut completed, false).await.unwrap();

        let all = db.list_executions(&ListFilter::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_running = db
            .list_executions(&ListFilter::new().with_status(Status::Running))
            .await
            .unwrap();
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, "exec-1");

        let by_diagram = db
            .list_executions(&ListFilter::new().with_diagram_id("diag-1"))
            .await
            .unwrap();
        assert_eq!(by_diagram.len(), 2);

        let paged = db
            .list_executions(&ListFilter::new().with_page(1, 0))
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn test_warm_state_query_prefers_active() {
        let db = manager().await;
        let mut active = CacheEntry::dirty(sample_state("exec-active"));
        active.access_count = 9;
        db.persist_entry("exec-active", &mut active, false)
            .await
            .unwrap();

        let mut done_state = sample_state("exec-done");
        done_state.finish(Status::Completed, None);
        let mut done = CacheEntry::dirty(done_state);
        db.persist_entry("exec-done", &mut done, false).await.unwrap();

        let warm = db.load_warm_states(10).await.unwrap();
        assert_eq!(warm.len(), 1);
        assert_eq!(warm[0].0.id, "exec-active");
        assert_eq!(warm[0].1, 9);
    }

    #[tokio::test]
    async fn test_cleanup_older_than() {
        let db = manager().await;
        let mut entry = CacheEntry::dirty(sample_state("exec-old"));
        db.persist_entry("exec-old", &mut entry, false).await.unwrap();

        let removed = db
            .cleanup_older_than(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.count_executions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_access_tracking() {
        let db = manager().await;
        let mut entry = CacheEntry::dirty(sample_state("exec-1"));
        db.persist_entry("exec-1", &mut entry, false).await.unwrap();

        db.update_access_tracking("exec-1").await.unwrap();
        db.update_access_tracking("exec-1").await.unwrap();

        let row = sqlx::query("SELECT access_count FROM executions WHERE execution_id = ?")
            .bind("exec-1")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let count: i64 = row.try_get("access_count").unwrap();
        assert_eq!(count, 2);
    }
}
