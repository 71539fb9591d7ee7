//! Dependency tracking for node scheduling
//!
//! Precomputes, from the resolved graph, the structures that let the
//! scheduler answer "is this node ready?" in constant time and "who does
//! this completion unblock?" in time proportional to the out-degree.
//!
//! Conditional edges never contribute to indegree: a branch target is
//! unblocked by the scheduler observing the condition's boolean result, not
//! by static graph shape. Edges from a skippable Condition to a target with
//! more than one distinct source are exempt as well, so a bypassed condition
//! cannot block the join.

use dipeo_core::{ExecutableDiagram, NodeId};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Counts exposed for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStats {
    pub total_nodes: usize,
    pub processed_nodes: usize,
    pub pending_nodes: usize,
    pub nodes_with_dependencies: usize,
}

/// Indegree, dependents, and priority dependencies for one execution.
#[derive(Debug)]
pub struct DependencyTracker {
    indegree: HashMap<NodeId, usize>,
    dependents: HashMap<NodeId, HashSet<NodeId>>,
    priority_dependencies: HashMap<NodeId, HashSet<NodeId>>,
    processed: HashSet<NodeId>,
    total_nodes: usize,
}

impl DependencyTracker {
    pub fn new(diagram: &ExecutableDiagram) -> Self {
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        for node in diagram.nodes() {
            indegree.insert(node.id.clone(), 0);
        }

        let mut dependents: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for edge in diagram.edges() {
            if edge.is_conditional() {
                continue;
            }

            // A skippable condition must not block a join target that has
            // other ways of being fed.
            let source_skippable = diagram
                .node(&edge.source)
                .map(|n| n.is_skippable())
                .unwrap_or(false);
            if source_skippable {
                let distinct_sources: HashSet<&str> = diagram
                    .incoming_edges(&edge.target)
                    .map(|e| e.source.as_str())
                    .collect();
                if distinct_sources.len() > 1 {
                    continue;
                }
            }

            *indegree.entry(edge.target.clone()).or_insert(0) += 1;
            dependents
                .entry(edge.source.clone())
                .or_default()
                .insert(edge.target.clone());
        }

        // Siblings of one source, ordered by edge priority: every lower-
        // priority target waits on every strictly higher-priority target.
        let mut priority_dependencies: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for node in diagram.nodes() {
            let mut outgoing: Vec<_> = diagram.outgoing_edges(&node.id).collect();
            if outgoing.len() < 2 {
                continue;
            }
            outgoing.sort_by_key(|e| -e.execution_priority);
            for (i, lower) in outgoing.iter().enumerate() {
                for higher in &outgoing[..i] {
                    if higher.execution_priority > lower.execution_priority {
                        priority_dependencies
                            .entry(lower.target.clone())
                            .or_default()
                            .insert(higher.target.clone());
                    }
                }
            }
        }

        debug!(
            nodes = indegree.len(),
            priority_groups = priority_dependencies.len(),
            "dependency graph initialized"
        );

        Self {
            total_nodes: indegree.len(),
            indegree,
            dependents,
            priority_dependencies,
            processed: HashSet::new(),
        }
    }

    /// Nodes with no unmet static dependencies.
    pub fn initial_ready(&self) -> HashSet<NodeId> {
        self.indegree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Mark a node completed (or skipped) and return dependents whose
    /// indegree just reached zero. Idempotent: a second call is a no-op.
    pub fn mark_completed(&mut self, node_id: &str) -> HashSet<NodeId> {
        if !self.processed.insert(node_id.to_string()) {
            return HashSet::new();
        }

        let mut newly_ready = HashSet::new();
        if let Some(dependents) = self.dependents.get(node_id) {
            for dependent in dependents {
                if let Some(count) = self.indegree.get_mut(dependent) {
                    if *count > 0 {
                        *count -= 1;
                        if *count == 0 {
                            newly_ready.insert(dependent.clone());
                        }
                    }
                }
            }
        }
        newly_ready
    }

    /// Whether a node has been completed or skipped.
    pub fn is_processed(&self, node_id: &str) -> bool {
        self.processed.contains(node_id)
    }

    pub fn indegree(&self, node_id: &str) -> usize {
        self.indegree.get(node_id).copied().unwrap_or(0)
    }

    pub fn dependents(&self, node_id: &str) -> HashSet<NodeId> {
        self.dependents.get(node_id).cloned().unwrap_or_default()
    }

    /// Higher-priority siblings that must complete before this node runs.
    pub fn priority_dependencies(&self, node_id: &str) -> Option<&HashSet<NodeId>> {
        self.priority_dependencies.get(node_id)
    }

    pub fn stats(&self) -> DependencyStats {
        DependencyStats {
            total_nodes: self.total_nodes,
            processed_nodes: self.processed.len(),
            pending_nodes: self.total_nodes.saturating_sub(self.processed.len()),
            nodes_with_dependencies: self.indegree.values().filter(|&&c| c > 0).count(),
        }
    }
}
