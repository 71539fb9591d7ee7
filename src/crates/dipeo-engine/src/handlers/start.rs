//! Start node handler

use async_trait::async_trait;
use dipeo_core::{Envelope, HandlerContext, HandlerError, Inputs, Node, NodeHandler};
use serde_json::Value;

/// Emits the execution's initial variables so downstream edges have a
/// source value to extract from.
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn handle(
        &self,
        node: &Node,
        _inputs: &Inputs,
        ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError> {
        let variables: serde_json::Map<String, Value> = ctx
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Envelope::json(&node.id, Value::Object(variables)))
    }
}
