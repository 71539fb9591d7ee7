//! Domain events
//!
//! The engine emits ordered events for every observable transition; the state
//! store and any other observers consume them through the [`EventSink`]
//! trait. Events within one execution carry a strictly increasing sequence
//! number so replayed or re-delivered events can be deduplicated.

use crate::diagram::NodeId;
use crate::envelope::WireEnvelope;
use crate::state::{ExecutionId, LlmUsage, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    NodeStarted,
    NodeCompleted,
    NodeError,
    NodeSkipped,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::ExecutionStarted => "EXECUTION_STARTED",
            EventType::ExecutionCompleted => "EXECUTION_COMPLETED",
            EventType::ExecutionFailed => "EXECUTION_FAILED",
            EventType::NodeStarted => "NODE_STARTED",
            EventType::NodeCompleted => "NODE_COMPLETED",
            EventType::NodeError => "NODE_ERROR",
            EventType::NodeSkipped => "NODE_SKIPPED",
        };
        f.write_str(s)
    }
}

/// What an event is about: an execution, optionally narrowed to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventScope {
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

impl EventScope {
    pub fn execution(execution_id: impl Into<ExecutionId>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: None,
        }
    }

    pub fn node(execution_id: impl Into<ExecutionId>, node_id: impl Into<NodeId>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: Some(node_id.into()),
        }
    }
}

/// One ordered, observable transition within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub scope: EventScope,
    /// Monotonic per-execution sequence number, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    /// Free-form producer metadata, not interpreted by the store.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, Value>,
}

impl DomainEvent {
    pub fn new(event_type: EventType, scope: EventScope, seq: u64, payload: Value) -> Self {
        Self {
            event_type,
            scope,
            seq,
            timestamp: Utc::now(),
            payload,
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn execution_started(execution_id: &str, seq: u64, diagram_id: Option<&str>) -> Self {
        Self::new(
            EventType::ExecutionStarted,
            EventScope::execution(execution_id),
            seq,
            json!({ "diagram_id": diagram_id }),
        )
    }

    pub fn execution_completed(
        execution_id: &str,
        seq: u64,
        status: Status,
        error: Option<&str>,
    ) -> Self {
        Self::new(
            EventType::ExecutionCompleted,
            EventScope::execution(execution_id),
            seq,
            json!({ "status": status, "error": error }),
        )
    }

    pub fn execution_failed(execution_id: &str, seq: u64, error: &str) -> Self {
        Self::new(
            EventType::ExecutionFailed,
            EventScope::execution(execution_id),
            seq,
            json!({ "error": error }),
        )
    }

    pub fn node_started(execution_id: &str, node_id: &str, seq: u64, iteration: u32) -> Self {
        Self::new(
            EventType::NodeStarted,
            EventScope::node(execution_id, node_id),
            seq,
            json!({ "iteration": iteration }),
        )
    }

    pub fn node_completed(
        execution_id: &str,
        node_id: &str,
        seq: u64,
        output: WireEnvelope,
        llm_usage: Option<LlmUsage>,
    ) -> Self {
        Self::new(
            EventType::NodeCompleted,
            EventScope::node(execution_id, node_id),
            seq,
            json!({ "output": output, "llm_usage": llm_usage }),
        )
    }

    pub fn node_error(execution_id: &str, node_id: &str, seq: u64, error: &str) -> Self {
        Self::new(
            EventType::NodeError,
            EventScope::node(execution_id, node_id),
            seq,
            json!({ "error": error }),
        )
    }

    pub fn node_skipped(execution_id: &str, node_id: &str, seq: u64, reason: &str) -> Self {
        Self::new(
            EventType::NodeSkipped,
            EventScope::node(execution_id, node_id),
            seq,
            json!({ "reason": reason }),
        )
    }

    /// Terminal status carried by an `ExecutionCompleted` payload.
    pub fn payload_status(&self) -> Option<Status> {
        serde_json::from_value(self.payload.get("status")?.clone()).ok()
    }

    pub fn payload_error(&self) -> Option<String> {
        self.payload
            .get("error")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Output envelope carried by a `NodeCompleted` payload.
    pub fn payload_output(&self) -> Option<WireEnvelope> {
        serde_json::from_value(self.payload.get("output")?.clone()).ok()
    }

    pub fn payload_llm_usage(&self) -> Option<LlmUsage> {
        serde_json::from_value(self.payload.get("llm_usage")?.clone()).ok()
    }
}

/// Consumer of domain events.
///
/// Implementations must tolerate re-delivery; the sequence number identifies
/// duplicates within an execution.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: DomainEvent) {}
}

/// Sink that records events in memory, for tests and replay.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DomainEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<DomainEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: DomainEvent) {
        self.events.lock().push(event);
    }
}
