//! Execution engine for DiPeO diagrams
//!
//! This crate drives resolved diagrams to completion. The
//! [`DependencyTracker`] precomputes who blocks whom, the [`Scheduler`]
//! decides which nodes may run right now (condition branches, first-only
//! seeds, iteration caps, priority dependencies), and the
//! [`ExecutionEngine`] runs the outer loop: pop a ready node, resolve its
//! inputs, dispatch to the handler for its type, feed the output back, and
//! emit ordered domain events.
//!
//! The core loop of one execution is single-threaded and deterministic;
//! multiple executions run their own loops in parallel.

pub mod context;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod inputs;
pub mod retry;
pub mod scheduler;

pub use context::ExecutionContext;
pub use dependency::{DependencyStats, DependencyTracker};
pub use engine::{CancelHandle, EngineConfig, ExecutionEngine, ExecutionRun};
pub use error::{ExecutionError, Result};
pub use handlers::HandlerRegistry;
pub use retry::RetryConfig;
pub use scheduler::Scheduler;
