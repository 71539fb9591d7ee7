//! Edge input resolution
//!
//! For each validated incoming edge, extract a value from the source node's
//! envelope according to the edge's content type and bind it under the name
//! derived from the edge label or variable name.

use crate::context::ExecutionContext;
use dipeo_core::{ContentType, Edge, Envelope, HandlerError, InputValue, Inputs, Message};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::trace;

/// Resolve the inputs for one node dispatch.
pub fn resolve_inputs(
    node_id: &str,
    edges: &[Edge],
    ctx: &ExecutionContext,
) -> Result<Inputs, HandlerError> {
    trace!(node_id, edge_count = edges.len(), "resolving inputs");
    let mut inputs = Inputs::new();

    for edge in edges {
        let Some(envelope) = ctx.node_output(&edge.source) else {
            // Self edges re-enter before the first iteration has produced a
            // value; Start sources are permitted without output.
            continue;
        };

        let (name, value) = match edge.content_type {
            ContentType::RawText => {
                let name = edge
                    .label
                    .clone()
                    .unwrap_or_else(|| format!("raw_text_{}", edge.id));
                (name, InputValue::Text(envelope.as_text()))
            }
            ContentType::VariableInObject => {
                let path = edge.object_key_path.as_deref().ok_or_else(|| {
                    HandlerError::Validation(format!(
                        "edge {} with variable_in_object content is missing object_key_path",
                        edge.id
                    ))
                })?;
                let extracted = extract_path(&envelope.as_json(), path).ok_or_else(|| {
                    HandlerError::Validation(format!(
                        "edge {}: path '{}' not found in source output",
                        edge.id, path
                    ))
                })?;
                let name = edge.label.clone().unwrap_or_else(|| {
                    path.rsplit('.').next().unwrap_or(path).to_string()
                });
                (name, InputValue::Json(extracted))
            }
            ContentType::ConversationState => {
                let messages = conversation_view(envelope);
                let name = edge
                    .label
                    .clone()
                    .unwrap_or_else(|| "conversation_state".to_string());
                (name, InputValue::Conversation(messages))
            }
            ContentType::Object => {
                let name = edge
                    .label
                    .clone()
                    .or_else(|| edge.variable_name.clone())
                    .ok_or_else(|| {
                        HandlerError::Validation(format!(
                            "edge {} is missing a label or variable_name",
                            edge.id
                        ))
                    })?;
                (name, InputValue::Json(envelope.as_json()))
            }
        };

        inputs.insert(name, value);
    }

    Ok(inputs)
}

/// Message-history view of any envelope: conversations pass through, other
/// bodies normalize to a single user message.
fn conversation_view(envelope: &Envelope) -> Vec<Message> {
    match envelope.messages() {
        Some(messages) => messages.to_vec(),
        None => vec![Message::user(envelope.as_text())],
    }
}

/// Dotted-path traversal into a JSON value.
pub fn extract_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("template pattern is valid"))
}

/// Replace `{{var}}` with its value. Unknown names are left untouched.
pub fn render_template(template: &str, variables: &BTreeMap<String, Value>) -> String {
    template_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match variables.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
