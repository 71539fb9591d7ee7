//! Per-execution mutable working set
//!
//! The engine resolves edge inputs against this context. Node outputs are a
//! rolling latest value: when a node re-executes in a loop its entry is
//! overwritten, so edge validation always sees the most recent envelope.

use dipeo_core::{Envelope, LlmUsage, NodeId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;

/// Summary snapshot of an execution in flight.
#[derive(Debug, Clone)]
pub struct ContextSummary {
    pub execution_id: String,
    pub nodes_executed: usize,
    pub llm_usage: LlmUsage,
    pub elapsed_ms: u128,
    pub error_count: usize,
    pub execution_order: Vec<NodeId>,
}

/// Mutable state accumulated while one diagram executes.
#[derive(Debug)]
pub struct ExecutionContext {
    pub execution_id: String,
    node_outputs: BTreeMap<NodeId, Envelope>,
    node_execution_counts: BTreeMap<NodeId, u32>,
    variables: BTreeMap<String, Value>,
    errors: BTreeMap<NodeId, String>,
    execution_order: Vec<NodeId>,
    llm_usage: LlmUsage,
    start_time: Instant,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>, variables: BTreeMap<String, Value>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_outputs: BTreeMap::new(),
            node_execution_counts: BTreeMap::new(),
            variables,
            errors: BTreeMap::new(),
            execution_order: Vec::new(),
            llm_usage: LlmUsage::default(),
            start_time: Instant::now(),
        }
    }

    /// Increment and return the execution count for a node.
    pub fn increment_execution_count(&mut self, node_id: &str) -> u32 {
        let count = self
            .node_execution_counts
            .entry(node_id.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    pub fn execution_count(&self, node_id: &str) -> u32 {
        self.node_execution_counts.get(node_id).copied().unwrap_or(0)
    }

    pub fn execution_counts(&self) -> &BTreeMap<NodeId, u32> {
        &self.node_execution_counts
    }

    /// Store a node's output, overwriting any previous iteration, and append
    /// the node to the execution order on its first completion.
    pub fn set_node_output(&mut self, node_id: &str, output: Envelope) {
        if let Some(usage) = &output.meta.llm_usage {
            self.llm_usage.add(usage);
        }
        self.node_outputs.insert(node_id.to_string(), output);
        if !self.execution_order.iter().any(|n| n == node_id) {
            self.execution_order.push(node_id.to_string());
        }
    }

    /// Record a marker output (skip, demoted error) without adding the node
    /// to the execution order; only dispatched nodes appear there.
    pub fn set_skip_marker(&mut self, node_id: &str, output: Envelope) {
        self.node_outputs.insert(node_id.to_string(), output);
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Envelope> {
        self.node_outputs.get(node_id)
    }

    pub fn has_output(&self, node_id: &str) -> bool {
        self.node_outputs.contains_key(node_id)
    }

    pub fn node_outputs(&self) -> &BTreeMap<NodeId, Envelope> {
        &self.node_outputs
    }

    pub fn into_outputs(self) -> BTreeMap<NodeId, Envelope> {
        self.node_outputs
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn set_error(&mut self, node_id: &str, error: impl Into<String>) {
        self.errors.insert(node_id.to_string(), error.into());
    }

    pub fn error(&self, node_id: &str) -> Option<&str> {
        self.errors.get(node_id).map(String::as_str)
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn llm_usage(&self) -> LlmUsage {
        self.llm_usage
    }

    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }

    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            execution_id: self.execution_id.clone(),
            nodes_executed: self.node_outputs.len(),
            llm_usage: self.llm_usage,
            elapsed_ms: self.elapsed_ms(),
            error_count: self.errors.len(),
            execution_order: self.execution_order.clone(),
        }
    }
}
