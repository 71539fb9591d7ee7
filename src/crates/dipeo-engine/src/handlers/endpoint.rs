//! Endpoint node handler

use async_trait::async_trait;
use dipeo_core::{
    Envelope, HandlerContext, HandlerError, InputValue, Inputs, Node, NodeHandler,
};
use serde_json::Value;

/// Terminal node. Passes its first input through; with `data.path` set, the
/// result is also saved to a file before the execution completes.
pub struct EndpointHandler;

#[async_trait]
impl NodeHandler for EndpointHandler {
    async fn handle(
        &self,
        node: &Node,
        inputs: &Inputs,
        _ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError> {
        let envelope = match inputs.first() {
            Some(InputValue::Text(text)) => Envelope::text(&node.id, text.clone()),
            Some(InputValue::Json(value)) => Envelope::json(&node.id, value.clone()),
            Some(InputValue::Conversation(messages)) => {
                Envelope::conversation(&node.id, messages.clone())
            }
            None => Envelope::text(&node.id, ""),
        };

        if let Some(path) = node.data.get("path").and_then(Value::as_str) {
            tokio::fs::write(path, envelope.as_text())
                .await
                .map_err(|e| HandlerError::Transient(format!("saving to {path}: {e}")))?;
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::TestCtx;
    use dipeo_core::NodeType;
    use serde_json::json;

    #[tokio::test]
    async fn test_passthrough() {
        let state = TestCtx::new();
        let mut inputs = Inputs::new();
        inputs.insert("result", InputValue::Json(json!([1, 2])));

        let node = Node::new("end", NodeType::Endpoint);
        let envelope = EndpointHandler
            .handle(&node, &inputs, &state.ctx())
            .await
            .unwrap();
        assert_eq!(envelope.as_json(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_file_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.txt");

        let state = TestCtx::new();
        let mut inputs = Inputs::new();
        inputs.insert("result", InputValue::Text("final".into()));

        let node = Node::new("end", NodeType::Endpoint)
            .with_data("path", json!(path.to_str().unwrap()));
        EndpointHandler
            .handle(&node, &inputs, &state.ctx())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "final");
    }
}
