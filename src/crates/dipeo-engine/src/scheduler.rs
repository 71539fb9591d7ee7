//! Readiness decisions for diagram nodes
//!
//! The scheduler answers one question: which nodes may run right now. It
//! layers the runtime rules on top of the static [`DependencyTracker`]:
//! condition branch routing, first-only seed inputs, iteration caps,
//! priority-dependency gating, and bounded requeueing for nodes whose
//! inputs have not arrived yet.
//!
//! Edge validation distinguishes three outcomes. A *valid* edge contributes
//! to input resolution. A *blocked* edge could still be satisfied later
//! (the source is running, or a forward condition has not evaluated), so the
//! node is requeued. A *dropped* edge can never be satisfied in this
//! iteration (wrong branch, source on a dead path, or an unevaluated loop
//! back-edge), so it is ignored. A non-start node whose incoming edges all
//! dropped is silently discarded.

use crate::context::ExecutionContext;
use crate::dependency::DependencyTracker;
use dipeo_core::{Edge, ExecutableDiagram, NodeId, NodeType};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a readiness check.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// The node may run; `edges` are the validated incoming edges to
    /// resolve inputs from (inert seed edges already excluded).
    Ready { edges: Vec<Edge> },
    /// At least one dependency could still arrive; requeue.
    NotReady,
    /// Every incoming edge dropped; the node sits on a dead path.
    NoValidInputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeCheck {
    /// Contributes a value to input resolution.
    Valid,
    /// Validated but contributes no value (consumed seed edge).
    Inert,
    /// Could be satisfied later; blocks readiness.
    Blocked,
    /// Permanently unsatisfiable this iteration; ignored.
    Dropped,
}

/// Per-execution scheduling state.
pub struct Scheduler {
    diagram: Arc<ExecutableDiagram>,
    tracker: DependencyTracker,
    condition_values: HashMap<NodeId, bool>,
    first_only_consumed: HashSet<NodeId>,
    requeue_count: HashMap<NodeId, u32>,
    iteration_caps: HashMap<NodeId, u32>,
    permanently_skipped: HashSet<NodeId>,
    /// Conditional edges whose source condition is reachable from the
    /// target, meaning they close a loop. Unevaluated back-edges must not
    /// gate first entry into the loop.
    back_edges: HashSet<String>,
    max_requeue_attempts: u32,
    default_iteration_cap: u32,
}

impl Scheduler {
    pub fn new(
        diagram: Arc<ExecutableDiagram>,
        max_requeue_attempts: u32,
        default_iteration_cap: u32,
    ) -> Self {
        let tracker = DependencyTracker::new(&diagram);
        let iteration_caps = diagram.iteration_caps();

        let mut back_edges = HashSet::new();
        for edge in diagram.edges() {
            if edge.is_conditional() && Self::reaches(&diagram, &edge.target, &edge.source) {
                back_edges.insert(edge.id.clone());
            }
        }

        Self {
            diagram,
            tracker,
            condition_values: HashMap::new(),
            first_only_consumed: HashSet::new(),
            requeue_count: HashMap::new(),
            iteration_caps,
            permanently_skipped: HashSet::new(),
            back_edges,
            max_requeue_attempts,
            default_iteration_cap,
        }
    }

    /// DFS reachability over the raw edge set, branch labels ignored.
    fn reaches(diagram: &ExecutableDiagram, from: &str, to: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            for edge in diagram.outgoing_edges(&current) {
                stack.push(edge.target.clone());
            }
        }
        false
    }

    /// Whether the node has hit its iteration cap.
    pub fn should_skip(&self, node_id: &str, exec_count: u32) -> bool {
        let cap = self
            .iteration_caps
            .get(node_id)
            .copied()
            .unwrap_or(self.default_iteration_cap);
        exec_count >= cap
    }

    pub fn iteration_caps(&self) -> &HashMap<NodeId, u32> {
        &self.iteration_caps
    }

    /// Record that a node was skipped at its cap; it is treated as
    /// completed for dependency propagation and never dispatched again.
    pub fn mark_skipped(&mut self, node_id: &str) {
        self.permanently_skipped.insert(node_id.to_string());
        self.tracker.mark_completed(node_id);
    }

    pub fn is_skipped(&self, node_id: &str) -> bool {
        self.permanently_skipped.contains(node_id)
    }

    /// Propagate a completion through the static dependency graph.
    pub fn mark_completed(&mut self, node_id: &str) {
        self.tracker.mark_completed(node_id);
    }

    pub fn record_condition(&mut self, node_id: &str, value: bool) {
        debug!(node_id, value, "condition evaluated");
        self.condition_values.insert(node_id.to_string(), value);
    }

    pub fn condition_value(&self, node_id: &str) -> Option<bool> {
        self.condition_values.get(node_id).copied()
    }

    pub fn mark_first_only_consumed(&mut self, node_id: &str) {
        // Once ever: the flag survives loop re-entry.
        self.first_only_consumed.insert(node_id.to_string());
    }

    pub fn first_only_consumed(&self, node_id: &str) -> bool {
        self.first_only_consumed.contains(node_id)
    }

    /// Bounded requeue bookkeeping. Returns false once the bound is hit.
    pub fn handle_requeue(&mut self, node_id: &str) -> bool {
        let count = self.requeue_count.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        debug!(node_id, attempt = *count, "node requeued, dependencies unmet");
        if *count > self.max_requeue_attempts {
            warn!(
                node_id,
                attempts = *count,
                "requeue bound exceeded, breaking loop"
            );
            return false;
        }
        true
    }

    pub fn reset_requeue(&mut self, node_id: &str) {
        self.requeue_count.remove(node_id);
    }

    pub fn requeue_attempts(&self, node_id: &str) -> u32 {
        self.requeue_count.get(node_id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> crate::dependency::DependencyStats {
        self.tracker.stats()
    }

    /// Decide whether a node may run now, and with which incoming edges.
    pub fn check_dependencies(&self, node_id: &str, ctx: &ExecutionContext) -> Readiness {
        let Some(node) = self.diagram.node(node_id) else {
            return Readiness::NoValidInputs;
        };

        if node.node_type == NodeType::Start {
            return Readiness::Ready { edges: Vec::new() };
        }

        // Higher-priority siblings gate this node; a skipped sibling counts
        // as satisfied.
        if let Some(priority_deps) = self.tracker.priority_dependencies(node_id) {
            if priority_deps.iter().any(|dep| !self.tracker.is_processed(dep)) {
                return Readiness::NotReady;
            }
        }

        let incoming: Vec<&Edge> = self.diagram.incoming_edges(node_id).collect();
        if incoming.is_empty() {
            return Readiness::Ready { edges: Vec::new() };
        }

        // First-only seeding: a PersonJob-like node may begin on its seed
        // inputs alone, before its regular inputs exist.
        if node.node_type.is_llm_family() && !self.first_only_consumed(node_id) {
            let seeds: Vec<Edge> = incoming
                .iter()
                .filter(|e| e.is_first_only() && ctx.has_output(&e.source))
                .map(|&e| e.clone())
                .collect();
            if !seeds.is_empty() {
                return Readiness::Ready { edges: seeds };
            }
        }

        let mut resolution_edges = Vec::new();
        let mut validated = 0usize;
        for &edge in &incoming {
            match self.validate_edge(edge, node_id, ctx) {
                EdgeCheck::Valid => {
                    validated += 1;
                    resolution_edges.push(edge.clone());
                }
                EdgeCheck::Inert => validated += 1,
                EdgeCheck::Blocked => return Readiness::NotReady,
                EdgeCheck::Dropped => {}
            }
        }

        if validated == 0 {
            return Readiness::NoValidInputs;
        }
        Readiness::Ready {
            edges: resolution_edges,
        }
    }

    fn validate_edge(&self, edge: &Edge, target_id: &str, ctx: &ExecutionContext) -> EdgeCheck {
        let has_data = ctx.has_output(&edge.source);

        if edge.is_first_only() {
            if self.first_only_consumed(target_id) {
                // Seed already delivered; the edge stays satisfied but
                // contributes no further value.
                return EdgeCheck::Inert;
            }
            return if has_data {
                EdgeCheck::Valid
            } else {
                EdgeCheck::Blocked
            };
        }

        if let Some(branch) = edge.branch {
            return match self.condition_value(&edge.source) {
                Some(value) if branch.matches(value) => {
                    if has_data {
                        EdgeCheck::Valid
                    } else {
                        EdgeCheck::Blocked
                    }
                }
                Some(_) => EdgeCheck::Dropped,
                // A loop back-edge cannot gate first entry into the loop.
                None if self.back_edges.contains(&edge.id) => EdgeCheck::Dropped,
                None => EdgeCheck::Blocked,
            };
        }

        let source_is_start = self
            .diagram
            .node(&edge.source)
            .map(|n| n.node_type == NodeType::Start)
            .unwrap_or(false);

        if !has_data && !edge.is_self_edge() && !source_is_start {
            // A source that can never run anymore will never deliver.
            if self.is_dead(&edge.source, ctx, &mut HashSet::new()) {
                return EdgeCheck::Dropped;
            }
            return EdgeCheck::Blocked;
        }

        EdgeCheck::Valid
    }

    /// A node is dead when it has not produced output and every incoming
    /// edge is a wrong-branch conditional or comes from another dead node.
    fn is_dead(&self, node_id: &str, ctx: &ExecutionContext, visiting: &mut HashSet<NodeId>) -> bool {
        if ctx.has_output(node_id) {
            return false;
        }
        let Some(node) = self.diagram.node(node_id) else {
            return true;
        };
        if node.node_type == NodeType::Start {
            return false;
        }
        if !visiting.insert(node_id.to_string()) {
            // A cycle with no external live feed cannot come alive.
            return true;
        }

        let mut incoming = self.diagram.incoming_edges(node_id).peekable();
        if incoming.peek().is_none() {
            // Root node that simply has not run yet.
            return false;
        }

        for edge in incoming {
            if let Some(branch) = edge.branch {
                match self.condition_value(&edge.source) {
                    Some(value) if !branch.matches(value) => continue,
                    // Unevaluated or matching branch may still feed us,
                    // provided the condition itself can still run.
                    _ => {
                        if !self.is_dead(&edge.source, ctx, visiting) {
                            return false;
                        }
                    }
                }
            } else if ctx.has_output(&edge.source) || !self.is_dead(&edge.source, ctx, visiting) {
                return false;
            }
        }
        true
    }

    /// Targets to consider after `node_id` completes (or is skipped), with
    /// branch edges filtered by the recorded condition value and siblings
    /// ordered by descending edge priority.
    pub fn next_nodes(&self, node_id: &str) -> Vec<NodeId> {
        let is_condition = self
            .diagram
            .node(node_id)
            .map(|n| n.node_type == NodeType::Condition)
            .unwrap_or(false);

        let mut outgoing: Vec<&Edge> = self.diagram.outgoing_edges(node_id).collect();
        outgoing.sort_by_key(|e| -e.execution_priority);

        let mut seen = HashSet::new();
        let mut next = Vec::new();
        for edge in outgoing {
            if is_condition {
                if let Some(branch) = edge.branch {
                    match self.condition_value(node_id) {
                        Some(value) if branch.matches(value) => {}
                        _ => continue,
                    }
                }
            }
            if seen.insert(edge.target.clone()) {
                next.push(edge.target.clone());
            }
        }
        next
    }
}
