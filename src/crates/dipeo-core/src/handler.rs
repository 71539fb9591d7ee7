//! Node handler contract
//!
//! The engine dispatches each node to a handler for its type. Handlers are
//! external collaborators behind the [`NodeHandler`] trait: they receive the
//! node's static configuration, the inputs resolved from validated incoming
//! edges, and a read-only view of the execution. LLM-backed handlers reach
//! providers only through the [`LlmCapability`] seam.

use crate::diagram::{Node, NodeId};
use crate::envelope::{Conversation, Envelope, Message};
use crate::state::LlmUsage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Semantic error kinds a handler can surface.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Malformed node config or unresolvable input. Fatal to the node.
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O hiccup or provider 5xx; retried before surfacing.
    #[error("transient error: {0}")]
    Transient(String),

    /// Unrecoverable handler failure.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Handler exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl HandlerError {
    /// Whether the engine's retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_) | HandlerError::Timeout(_))
    }
}

/// A value bound to an input name, typed by the edge's content rule.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Text(String),
    Json(Value),
    Conversation(Vec<Message>),
}

impl InputValue {
    pub fn as_text(&self) -> String {
        match self {
            InputValue::Text(s) => s.clone(),
            InputValue::Json(v) => match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            InputValue::Conversation(messages) => messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        }
    }

    pub fn as_json(&self) -> Value {
        match self {
            InputValue::Text(s) => Value::String(s.clone()),
            InputValue::Json(v) => v.clone(),
            InputValue::Conversation(messages) => {
                serde_json::to_value(messages).unwrap_or(Value::Null)
            }
        }
    }

    pub fn as_messages(&self) -> Option<&[Message]> {
        match self {
            InputValue::Conversation(messages) => Some(messages),
            _ => None,
        }
    }
}

/// Inputs resolved for one dispatch: a name-keyed map plus arrival order.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    named: BTreeMap<String, InputValue>,
    ordered: Vec<InputValue>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: InputValue) {
        self.ordered.push(value.clone());
        self.named.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&InputValue> {
        self.named.get(name)
    }

    /// First input in edge arrival order.
    pub fn first(&self) -> Option<&InputValue> {
        self.ordered.first()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InputValue)> {
        self.named.iter()
    }

    /// Inputs as a JSON map, used for template rendering and expressions.
    pub fn to_value_map(&self) -> BTreeMap<String, Value> {
        self.named
            .iter()
            .map(|(name, value)| (name.clone(), value.as_json()))
            .collect()
    }
}

/// Read-only view of the running execution handed to handlers.
pub struct HandlerContext<'a> {
    pub execution_id: &'a str,
    pub variables: &'a BTreeMap<String, Value>,
    pub exec_counts: &'a BTreeMap<NodeId, u32>,
    pub iteration_caps: &'a HashMap<NodeId, u32>,
    pub node_outputs: &'a BTreeMap<NodeId, Envelope>,
    /// Sources of the validated incoming edges, in arrival order.
    pub upstream: Vec<NodeId>,
    pub llm_usage: LlmUsage,
    /// Shared conversation threaded to LLM-family nodes.
    pub conversation: Arc<RwLock<Conversation>>,
}

impl HandlerContext<'_> {
    pub fn exec_count(&self, node_id: &str) -> u32 {
        self.exec_counts.get(node_id).copied().unwrap_or(0)
    }

    pub fn iteration_cap(&self, node_id: &str) -> Option<u32> {
        self.iteration_caps.get(node_id).copied()
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Envelope> {
        self.node_outputs.get(node_id)
    }
}

/// Executes one node type.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError>;
}

/// A single provider reply.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub usage: LlmUsage,
}

/// Capability interface for LLM completion. Provider adapters implement
/// this; the engine and handlers never talk to a provider directly.
#[async_trait]
pub trait LlmCapability: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, HandlerError>;
}

/// Development capability that echoes the last user message back.
#[derive(Debug, Default)]
pub struct EchoLlm;

#[async_trait]
impl LlmCapability for EchoLlm {
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, HandlerError> {
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let prompt_tokens = messages.iter().map(|m| m.content.len() as u64).sum::<u64>() / 4;
        let reply_tokens = (text.len() as u64) / 4;
        Ok(LlmReply {
            usage: LlmUsage::new(prompt_tokens, reply_tokens),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inputs_preserve_arrival_order() {
        let mut inputs = Inputs::new();
        inputs.insert("z", InputValue::Text("first".into()));
        inputs.insert("a", InputValue::Text("second".into()));

        assert_eq!(inputs.first().unwrap().as_text(), "first");
        assert_eq!(inputs.get("a").unwrap().as_text(), "second");
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn test_input_value_coercions() {
        let value = InputValue::Json(json!({"k": 1}));
        assert_eq!(value.as_text(), r#"{"k":1}"#);

        let conversation =
            InputValue::Conversation(vec![Message::user("q"), Message::assistant("a")]);
        assert_eq!(conversation.as_text(), "a");
        assert_eq!(conversation.as_messages().unwrap().len(), 2);
    }

    #[test]
    fn test_error_transience() {
        assert!(HandlerError::Transient("503".into()).is_transient());
        assert!(HandlerError::Timeout("60s".into()).is_transient());
        assert!(!HandlerError::Validation("bad config".into()).is_transient());
        assert!(!HandlerError::Fatal("broken".into()).is_transient());
    }

    #[tokio::test]
    async fn test_echo_llm() {
        let llm = EchoLlm;
        let reply = llm
            .complete(&[Message::system("be brief"), Message::user("hello there")])
            .await
            .unwrap();
        assert_eq!(reply.text, "hello there");
        assert_eq!(reply.usage.total, reply.usage.input + reply.usage.output);
    }
}
