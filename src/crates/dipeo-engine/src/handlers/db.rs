//! DB node handler
//!
//! File-backed data source or sink. Reads return the file content as text;
//! writes store the first input and return what was written.

use async_trait::async_trait;
use dipeo_core::{Envelope, HandlerContext, HandlerError, Inputs, Node, NodeHandler};
use serde_json::Value;

pub struct DbHandler;

#[async_trait]
impl NodeHandler for DbHandler {
    async fn handle(
        &self,
        node: &Node,
        inputs: &Inputs,
        _ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError> {
        let operation = node
            .data
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("read");
        let path = node
            .data
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HandlerError::Validation(format!("db node {} is missing data.path", node.id))
            })?;

        match operation {
            "read" => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    HandlerError::Transient(format!("reading {path}: {e}"))
                })?;
                Ok(Envelope::text(&node.id, content))
            }
            "write" => {
                let content = inputs.first().map(|v| v.as_text()).unwrap_or_default();
                tokio::fs::write(path, &content).await.map_err(|e| {
                    HandlerError::Transient(format!("writing {path}: {e}"))
                })?;
                Ok(Envelope::text(&node.id, content))
            }
            other => Err(HandlerError::Validation(format!(
                "db node {} has unknown operation '{other}'",
                node.id
            ))),
        }
    }
}
