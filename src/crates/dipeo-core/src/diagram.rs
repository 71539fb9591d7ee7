//! Resolved diagram structures
//!
//! A diagram is a directed, possibly cyclic graph of typed nodes connected by
//! edges that carry typed payloads. The engine consumes diagrams that have
//! already been parsed and resolved; nothing here mutates during execution.
//!
//! Edges carry the attributes that drive scheduling: an optional branch label
//! for Condition outputs, a handle mode distinguishing recurring inputs from
//! first-execution-only seeds, and an execution priority that induces ordering
//! between sibling targets of a shared source.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Node identifier, unique within a diagram.
pub type NodeId = String;

/// The kind of work a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Entry point; always ready, carries the initial variables.
    Start,
    /// Single LLM invocation with conversation threading.
    PersonJob,
    /// LLM invocation mapped over a batch of inputs.
    PersonBatchJob,
    /// Boolean branch point; outgoing edges may carry branch labels.
    Condition,
    /// File-backed data source or sink.
    Db,
    /// General-purpose work node (echo, template rendering).
    Job,
    /// Terminal node; reaching it completes the execution.
    Endpoint,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::PersonJob => "person_job",
            NodeType::PersonBatchJob => "person_batch_job",
            NodeType::Condition => "condition",
            NodeType::Db => "db",
            NodeType::Job => "job",
            NodeType::Endpoint => "endpoint",
        }
    }

    /// Nodes that receive the shared conversation object.
    pub fn is_llm_family(&self) -> bool {
        matches!(self, NodeType::PersonJob | NodeType::PersonBatchJob)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canvas position. Irrelevant to execution, preserved for round-tripping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single node: identity, type tag, and static configuration.
///
/// The `data` map carries per-type configuration. Keys recognized by the
/// scheduler itself:
///
/// - `max_iterations`: per-node cycle cap (integer)
/// - `skippable`: a Condition that may be bypassed without blocking
/// - `continue_on_error`: demote a handler failure to a skip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub position: Position,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            data: serde_json::Map::new(),
            position: Position::default(),
        }
    }

    /// Set a configuration key, builder style.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Per-node iteration cap, if configured.
    pub fn max_iterations(&self) -> Option<u32> {
        self.data
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
    }

    pub fn is_skippable(&self) -> bool {
        self.node_type == NodeType::Condition
            && self
                .data
                .get("skippable")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    pub fn continue_on_error(&self) -> bool {
        self.data
            .get("continue_on_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// How an edge's payload is interpreted when resolving the target's inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// String value of the source envelope.
    #[default]
    RawText,
    /// Extract from a JSON-like body by dotted key path.
    VariableInObject,
    /// Full message history as `{role, content}` records.
    ConversationState,
    /// The raw envelope body, bound under the edge label.
    Object,
}

/// Whether an edge feeds every execution of its target or only the first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleMode {
    #[default]
    Default,
    /// Seed input, consumed only on the target's first execution.
    FirstOnly,
}

/// Branch label on an edge leaving a Condition node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    True,
    False,
}

impl Branch {
    pub fn matches(&self, value: bool) -> bool {
        matches!(self, Branch::True) == value
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    pub target: NodeId,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    /// Binds the edge's value to a name in the target's variable map.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub variable_name: Option<String>,
    /// Dotted path for `VariableInObject` extraction.
    #[serde(default)]
    pub object_key_path: Option<String>,
    #[serde(default)]
    pub handle_mode: HandleMode,
    #[serde(default)]
    pub branch: Option<Branch>,
    /// Higher-priority edges from the same source gate their siblings.
    #[serde(default)]
    pub execution_priority: i32,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            content_type: ContentType::default(),
            label: None,
            variable_name: None,
            object_key_path: None,
            handle_mode: HandleMode::default(),
            branch: None,
            execution_priority: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_object_key_path(mut self, path: impl Into<String>) -> Self {
        self.object_key_path = Some(path.into());
        self
    }

    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn first_only(mut self) -> Self {
        self.handle_mode = HandleMode::FirstOnly;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.execution_priority = priority;
        self
    }

    /// A branch output whose traversal depends on the source's boolean result.
    pub fn is_conditional(&self) -> bool {
        self.branch.is_some()
    }

    pub fn is_first_only(&self) -> bool {
        self.handle_mode == HandleMode::FirstOnly
    }

    pub fn is_self_edge(&self) -> bool {
        self.source == self.target
    }
}

/// A fully resolved diagram with node and edge lookup indices.
///
/// Cycles are permitted; loop termination is the scheduler's concern
/// (iteration caps, condition exits, terminal endpoints).
#[derive(Debug, Clone)]
pub struct ExecutableDiagram {
    pub id: Option<String>,
    nodes: HashMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    edges: Vec<Edge>,
    outgoing: HashMap<NodeId, Vec<usize>>,
    incoming: HashMap<NodeId, Vec<usize>>,
}

impl ExecutableDiagram {
    pub fn new(id: Option<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let node_order: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let nodes: HashMap<NodeId, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.source.clone()).or_default().push(idx);
            incoming.entry(edge.target.clone()).or_default().push(idx);
        }

        Self {
            id,
            nodes,
            node_order,
            edges,
            outgoing,
            incoming,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes in their original declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.edges[idx])
    }

    pub fn incoming_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.edges[idx])
    }

    pub fn start_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.node_type == NodeType::Start)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Iteration caps keyed by node, read from node configuration.
    pub fn iteration_caps(&self) -> HashMap<NodeId, u32> {
        self.nodes()
            .filter_map(|n| n.max_iterations().map(|cap| (n.id.clone(), cap)))
            .collect()
    }

    /// Verify every edge endpoint names a real node.
    pub fn validate(&self) -> Result<(), String> {
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                return Err(format!(
                    "edge {} source {} does not exist",
                    edge.id, edge.source
                ));
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(format!(
                    "edge {} target {} does not exist",
                    edge.id, edge.target
                ));
            }
        }
        Ok(())
    }
}
