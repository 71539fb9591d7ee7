//! Built-in node handlers
//!
//! One handler per node type, registered in a [`HandlerRegistry`] the engine
//! dispatches through. LLM-family handlers reach providers only via the
//! [`LlmCapability`](dipeo_core::LlmCapability) seam.

pub mod condition;
pub mod db;
pub mod endpoint;
pub mod job;
pub mod person_job;
pub mod start;

pub use condition::ConditionHandler;
pub use db::DbHandler;
pub use endpoint::EndpointHandler;
pub use job::JobHandler;
pub use person_job::{PersonBatchJobHandler, PersonJobHandler};
pub use start::StartHandler;

use dipeo_core::{LlmCapability, NodeHandler, NodeType};
use std::collections::HashMap;
use std::sync::Arc;

/// Dispatch table from node type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler, LLM nodes wired to `llm`.
    pub fn with_defaults(llm: Arc<dyn LlmCapability>) -> Self {
        let mut registry = Self::new();
        registry.register(NodeType::Start, Arc::new(StartHandler));
        registry.register(NodeType::Condition, Arc::new(ConditionHandler));
        registry.register(NodeType::Job, Arc::new(JobHandler));
        registry.register(NodeType::Db, Arc::new(DbHandler));
        registry.register(NodeType::Endpoint, Arc::new(EndpointHandler));
        registry.register(
            NodeType::PersonJob,
            Arc::new(PersonJobHandler::new(llm.clone())),
        );
        registry.register(
            NodeType::PersonBatchJob,
            Arc::new(PersonBatchJobHandler::new(llm)),
        );
        registry
    }

    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type, handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use dipeo_core::{Conversation, Envelope, HandlerContext, LlmUsage, NodeId};
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// Owns the state a [`HandlerContext`] borrows, for handler unit tests.
    pub(crate) struct TestCtx {
        pub variables: BTreeMap<String, Value>,
        pub exec_counts: BTreeMap<NodeId, u32>,
        pub iteration_caps: HashMap<NodeId, u32>,
        pub outputs: BTreeMap<NodeId, Envelope>,
        pub upstream: Vec<NodeId>,
        pub conversation: Arc<RwLock<Conversation>>,
    }

    impl TestCtx {
        pub fn new() -> Self {
            Self {
                variables: BTreeMap::new(),
                exec_counts: BTreeMap::new(),
                iteration_caps: HashMap::new(),
                outputs: BTreeMap::new(),
                upstream: Vec::new(),
                conversation: Arc::new(RwLock::new(Conversation::default())),
            }
        }

        pub fn ctx(&self) -> HandlerContext<'_> {
            HandlerContext {
                execution_id: "exec-test",
                variables: &self.variables,
                exec_counts: &self.exec_counts,
                iteration_caps: &self.iteration_caps,
                node_outputs: &self.outputs,
                upstream: self.upstream.clone(),
                llm_usage: LlmUsage::default(),
                conversation: self.conversation.clone(),
            }
        }
    }
}
