//! Job node handler

use crate::inputs::render_template;
use async_trait::async_trait;
use dipeo_core::{
    Envelope, HandlerContext, HandlerError, InputValue, Inputs, Node, NodeHandler,
};
use serde_json::Value;

/// General-purpose work node.
///
/// - `echo` (default): pass the first input through unchanged.
/// - `template`: render `data.template` against the inputs and execution
///   variables.
pub struct JobHandler;

#[async_trait]
impl NodeHandler for JobHandler {
    async fn handle(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError> {
        let sub_type = node
            .data
            .get("sub_type")
            .and_then(Value::as_str)
            .unwrap_or("echo");

        match sub_type {
            "echo" => Ok(echo_envelope(&node.id, inputs.first())),
            "template" => {
                let template = node
                    .data
                    .get("template")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        HandlerError::Validation(format!(
                            "template job {} is missing data.template",
                            node.id
                        ))
                    })?;
                let mut scope = ctx.variables.clone();
                scope.extend(inputs.to_value_map());
                Ok(Envelope::text(&node.id, render_template(template, &scope)))
            }
            other => Err(HandlerError::Validation(format!(
                "job {} has unknown sub_type '{other}'",
                node.id
            ))),
        }
    }
}

fn echo_envelope(node_id: &str, input: Option<&InputValue>) -> Envelope {
    match input {
        Some(InputValue::Text(text)) => Envelope::text(node_id, text.clone()),
        Some(InputValue::Json(value)) => Envelope::json(node_id, value.clone()),
        Some(InputValue::Conversation(messages)) => {
            Envelope::conversation(node_id, messages.clone())
        }
        None => Envelope::text(node_id, ""),
    }
}
