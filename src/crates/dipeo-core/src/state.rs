//! Durable execution state
//!
//! `ExecutionState` is the record the state store persists. All maps are
//! `BTreeMap` so canonical JSON serialization is deterministic: persisting a
//! state, loading it, and persisting again yields identical bytes.

use crate::diagram::NodeId;
use crate::envelope::WireEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Execution identifier.
pub type ExecutionId = String;

/// Lifecycle status shared by executions and individual nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Aborted => "aborted",
            Status::Skipped => "skipped",
        }
    }

    /// Terminal statuses imply `ended_at` is set and the execution is inactive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Aborted)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Pending | Status::Running | Status::Paused)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "paused" => Ok(Status::Paused),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "aborted" => Ok(Status::Aborted),
            "skipped" => Ok(Status::Skipped),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Cumulative token counts. `cached` is informational and never added into
/// `total`; the invariant is `total == input + output`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cached: Option<u64>,
    pub total: u64,
}

impl LlmUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            cached: None,
            total: input + output,
        }
    }

    pub fn with_cached(mut self, cached: u64) -> Self {
        self.cached = Some(cached);
        self
    }

    /// Accumulate another usage record, restoring the total invariant.
    pub fn add(&mut self, other: &LlmUsage) {
        self.input += other.input;
        self.output += other.output;
        if let Some(cached) = other.cached {
            self.cached = Some(self.cached.unwrap_or(0) + cached);
        }
        self.total = self.input + self.output;
    }
}

/// Per-node runtime record inside an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: Option<Status>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsage>,
}

/// The durable record of one diagram execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: ExecutionId,
    pub status: Status,
    #[serde(default)]
    pub diagram_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_states: BTreeMap<NodeId, NodeState>,
    #[serde(default)]
    pub node_outputs: BTreeMap<NodeId, WireEnvelope>,
    #[serde(default)]
    pub llm_usage: LlmUsage,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub exec_counts: BTreeMap<NodeId, u32>,
    #[serde(default)]
    pub executed_nodes: Vec<NodeId>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl ExecutionState {
    pub fn new(
        id: impl Into<ExecutionId>,
        diagram_id: Option<String>,
        variables: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            status: Status::Pending,
            diagram_id,
            started_at: Utc::now(),
            ended_at: None,
            node_states: BTreeMap::new(),
            node_outputs: BTreeMap::new(),
            llm_usage: LlmUsage::default(),
            error: None,
            variables,
            exec_counts: BTreeMap::new(),
            executed_nodes: Vec::new(),
            is_active: true,
        }
    }

    /// Transition to a terminal status, stamping `ended_at`.
    pub fn finish(&mut self, status: Status, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
        self.is_active = false;
    }

    /// Record a node in execution order. Loop iterations do not duplicate
    /// the entry; the count map carries the repetition.
    pub fn record_executed(&mut self, node_id: &str) {
        if !self.executed_nodes.iter().any(|n| n == node_id) {
            self.executed_nodes.push(node_id.to_string());
        }
        *self.exec_counts.entry(node_id.to_string()).or_insert(0) += 1;
    }
}
