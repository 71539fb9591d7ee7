//! PersonJob handlers
//!
//! LLM-backed nodes. The prompt is rendered from node configuration against
//! the resolved inputs and execution variables, threaded through the shared
//! conversation, and completed via the [`LlmCapability`] seam. Token usage
//! travels back on the envelope metadata.

use crate::inputs::render_template;
use async_trait::async_trait;
use dipeo_core::{
    Envelope, HandlerContext, HandlerError, Inputs, LlmCapability, LlmUsage, Message, Node,
    NodeHandler,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct PersonJobHandler {
    llm: Arc<dyn LlmCapability>,
}

impl PersonJobHandler {
    pub fn new(llm: Arc<dyn LlmCapability>) -> Self {
        Self { llm }
    }
}

/// Pick the prompt template: `first_prompt` applies only to the node's
/// first execution, `prompt` to every one after that.
fn select_prompt<'a>(node: &'a Node, ctx: &HandlerContext<'_>) -> Option<&'a str> {
    let first_execution = ctx.exec_count(&node.id) <= 1;
    if first_execution {
        if let Some(first) = node.data.get("first_prompt").and_then(Value::as_str) {
            return Some(first);
        }
    }
    node.data.get("prompt").and_then(Value::as_str)
}

fn render_scope(inputs: &Inputs, ctx: &HandlerContext<'_>) -> BTreeMap<String, Value> {
    let mut scope = ctx.variables.clone();
    scope.extend(inputs.to_value_map());
    scope
}

#[async_trait]
impl NodeHandler for PersonJobHandler {
    async fn handle(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError> {
        let scope = render_scope(inputs, ctx);
        let prompt = match select_prompt(node, ctx) {
            Some(template) => render_template(template, &scope),
            // With no prompt configured, the first input is the prompt.
            None => inputs.first().map(|v| v.as_text()).unwrap_or_default(),
        };
        if prompt.is_empty() {
            return Err(HandlerError::Validation(format!(
                "person_job {} resolved an empty prompt",
                node.id
            )));
        }

        // Seed the shared conversation from a conversation input on first
        // contact, then append this turn.
        let messages = {
            let mut conversation = ctx.conversation.write().await;
            if conversation.is_empty() {
                if let Some(history) = inputs.iter().find_map(|(_, v)| v.as_messages()) {
                    for message in history {
                        conversation.push(message.clone());
                    }
                }
            }
            conversation.push(Message::user(prompt));
            conversation.messages.clone()
        };

        debug!(node_id = %node.id, turns = messages.len(), "dispatching completion");
        let reply = self.llm.complete(&messages).await?;

        ctx.conversation
            .write()
            .await
            .push(Message::assistant(reply.text.clone()));

        Ok(Envelope::text(&node.id, reply.text).with_llm_usage(reply.usage))
    }
}

/// PersonJob mapped over an array input: one completion per item, replies
/// collected into an array, usage summed.
pub struct PersonBatchJobHandler {
    llm: Arc<dyn LlmCapability>,
}

impl PersonBatchJobHandler {
    pub fn new(llm: Arc<dyn LlmCapability>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl NodeHandler for PersonBatchJobHandler {
    async fn handle(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError> {
        let template = node
            .data
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HandlerError::Validation(format!(
                    "person_batch_job {} is missing data.prompt",
                    node.id
                ))
            })?;

        let items: Vec<Value> = match inputs.first().map(|v| v.as_json()) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => {
                return Err(HandlerError::Validation(format!(
                    "person_batch_job {} received no batch input",
                    node.id
                )))
            }
        };

        let mut replies = Vec::with_capacity(items.len());
        let mut total_usage = LlmUsage::default();
        for item in items {
            let mut scope = render_scope(inputs, ctx);
            scope.insert("item".to_string(), item);
            let prompt = render_template(template, &scope);

            let reply = self.llm.complete(&[Message::user(prompt)]).await?;
            total_usage.add(&reply.usage);
            replies.push(Value::String(reply.text));
        }

        debug!(node_id = %node.id, batch = replies.len(), "batch completed");
        Ok(Envelope::json(&node.id, Value::Array(replies)).with_llm_usage(total_usage))
    }
}
