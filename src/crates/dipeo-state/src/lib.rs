//! Cache-first state store for DiPeO executions
//!
//! Durable [`ExecutionState`](dipeo_core::ExecutionState) with an in-memory
//! primary copy. All reads and writes go through the cache; the database is
//! written at checkpoints, on critical events, and when dirty entries age
//! out. Domain events are applied idempotently: every event carries a
//! per-execution sequence number recorded in a transitions table with a
//! unique constraint, so replayed or re-delivered events never corrupt
//! state.
//!
//! Layout mirrors the responsibilities: [`cache`] manages the in-memory
//! entries, eviction, and the warm set; [`persistence`] owns the SQLite
//! schema and queries; [`store`] ties them together behind the event-driven
//! facade.

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod persistence;
pub mod store;

pub use cache::CacheManager;
pub use config::StateStoreConfig;
pub use error::{Result, StateStoreError};
pub use models::{CacheEntry, PersistenceCheckpoint, StoreMetrics, StoreMetricsSnapshot};
pub use persistence::{ListFilter, PersistenceManager};
pub use store::CacheFirstStateStore;
