//! Envelope payloads
//!
//! An envelope is the value a node produces. The body is a tagged union so
//! downstream edges can extract text, JSON fields, or conversation history
//! without guessing at the shape. Envelopes persist through a versioned wire
//! form; the in-memory type stays free to evolve independently.

use crate::diagram::NodeId;
use crate::state::LlmUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current envelope wire format version.
pub const WIRE_FORMAT: u32 = 1;

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Shared conversation threaded to LLM-family nodes within one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Tagged payload body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Text(String),
    Json(Value),
    Conversation(Vec<Message>),
    Binary(Vec<u8>),
}

impl EnvelopeBody {
    /// String rendering used by `raw_text` extraction.
    pub fn to_text(&self) -> String {
        match self {
            EnvelopeBody::Text(s) => s.clone(),
            EnvelopeBody::Json(v) => match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            // A conversation reads as its last message content.
            EnvelopeBody::Conversation(messages) => messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            EnvelopeBody::Binary(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }

    pub fn as_json(&self) -> Value {
        match self {
            EnvelopeBody::Text(s) => Value::String(s.clone()),
            EnvelopeBody::Json(v) => v.clone(),
            EnvelopeBody::Conversation(messages) => {
                serde_json::to_value(messages).unwrap_or(Value::Null)
            }
            EnvelopeBody::Binary(bytes) => {
                serde_json::to_value(bytes.clone()).unwrap_or(Value::Null)
            }
        }
    }
}

/// Envelope metadata: production time plus optional LLM usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsage>,
}

/// The typed value produced by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub produced_by: NodeId,
    pub content_type: String,
    pub body: EnvelopeBody,
    #[serde(default)]
    pub meta: EnvelopeMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub representations: Option<BTreeMap<String, Value>>,
}

impl Envelope {
    fn with_body(produced_by: impl Into<NodeId>, content_type: &str, body: EnvelopeBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            produced_by: produced_by.into(),
            content_type: content_type.to_string(),
            body,
            meta: EnvelopeMeta {
                timestamp: Some(Utc::now()),
                llm_usage: None,
            },
            representations: None,
        }
    }

    pub fn text(produced_by: impl Into<NodeId>, text: impl Into<String>) -> Self {
        Self::with_body(produced_by, "raw_text", EnvelopeBody::Text(text.into()))
    }

    pub fn json(produced_by: impl Into<NodeId>, value: Value) -> Self {
        Self::with_body(produced_by, "object", EnvelopeBody::Json(value))
    }

    pub fn conversation(produced_by: impl Into<NodeId>, messages: Vec<Message>) -> Self {
        Self::with_body(
            produced_by,
            "conversation_state",
            EnvelopeBody::Conversation(messages),
        )
    }

    /// Error payload recorded when a failed node is demoted to a skip.
    pub fn error_body(produced_by: impl Into<NodeId>, error: impl Into<String>) -> Self {
        let produced_by = produced_by.into();
        let error: String = error.into();
        Self::with_body(
            produced_by.clone(),
            "object",
            EnvelopeBody::Json(serde_json::json!({
                "error": error,
                "produced_by": produced_by,
            })),
        )
    }

    /// Marker output recorded when a node is skipped at its iteration cap.
    pub fn max_iterations_marker(produced_by: impl Into<NodeId>) -> Self {
        Self::with_body(
            produced_by,
            "object",
            EnvelopeBody::Json(serde_json::json!({ "skipped_max_iter": true })),
        )
    }

    pub fn with_llm_usage(mut self, usage: LlmUsage) -> Self {
        self.meta.llm_usage = Some(usage);
        self
    }

    pub fn as_text(&self) -> String {
        self.body.to_text()
    }

    pub fn as_json(&self) -> Value {
        self.body.as_json()
    }

    /// Message history if this envelope wraps a conversation.
    pub fn messages(&self) -> Option<&[Message]> {
        match &self.body {
            EnvelopeBody::Conversation(messages) => Some(messages),
            _ => None,
        }
    }

    /// Boolean reading of the body, used for Condition results.
    pub fn is_truthy(&self) -> bool {
        match &self.body {
            EnvelopeBody::Text(s) => !s.is_empty() && s != "false" && s != "0",
            EnvelopeBody::Json(v) => match v {
                Value::Bool(b) => *b,
                Value::Null => false,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Value::String(s) => !s.is_empty() && s != "false",
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
            },
            EnvelopeBody::Conversation(messages) => !messages.is_empty(),
            EnvelopeBody::Binary(bytes) => !bytes.is_empty(),
        }
    }

    /// True for the marker produced at an iteration-cap skip.
    pub fn is_max_iterations_marker(&self) -> bool {
        matches!(
            &self.body,
            EnvelopeBody::Json(Value::Object(map))
                if map.get("skipped_max_iter").and_then(Value::as_bool).unwrap_or(false)
        )
    }
}

/// Persisted form of an envelope, tagged with a format version.
///
/// Everything that leaves memory (event payloads, the executions table) goes
/// through this type so older rows can be migrated when the format changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub envelope_format: u32,
    pub id: Uuid,
    pub produced_by: NodeId,
    pub content_type: String,
    pub body: EnvelopeBody,
    #[serde(default)]
    pub meta: EnvelopeMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub representations: Option<BTreeMap<String, Value>>,
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        Self {
            envelope_format: WIRE_FORMAT,
            id: envelope.id,
            produced_by: envelope.produced_by,
            content_type: envelope.content_type,
            body: envelope.body,
            meta: envelope.meta,
            representations: envelope.representations,
        }
    }
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        Self {
            id: wire.id,
            produced_by: wire.produced_by,
            content_type: wire.content_type,
            body: wire.body,
            meta: wire.meta,
            representations: wire.representations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_envelope() {
        let envelope = Envelope::text("node-1", "hello");
        assert_eq!(envelope.as_text(), "hello");
        assert_eq!(envelope.produced_by, "node-1");
        assert!(envelope.is_truthy());
    }

    #[test]
    fn test_json_body_to_text() {
        let envelope = Envelope::json("n", json!({"x": 1}));
        assert_eq!(envelope.as_text(), r#"{"x":1}"#);
        let string_body = Envelope::json("n", json!("plain"));
        assert_eq!(string_body.as_text(), "plain");
    }

    #[test]
    fn test_conversation_reads_as_last_message() {
        let envelope = Envelope::conversation(
            "n",
            vec![Message::user("question"), Message::assistant("answer")],
        );
        assert_eq!(envelope.as_text(), "answer");
        assert_eq!(envelope.messages().unwrap().len(), 2);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Envelope::text("n", "").is_truthy());
        assert!(!Envelope::text("n", "false").is_truthy());
        assert!(Envelope::json("n", json!(true)).is_truthy());
        assert!(!Envelope::json("n", json!(0)).is_truthy());
        assert!(Envelope::json("n", json!([1])).is_truthy());
    }

    #[test]
    fn test_max_iterations_marker() {
        let marker = Envelope::max_iterations_marker("loop");
        assert!(marker.is_max_iterations_marker());
        assert!(!Envelope::text("loop", "done").is_max_iterations_marker());
    }

    #[test]
    fn test_wire_round_trip() {
        let envelope = Envelope::text("n", "payload").with_llm_usage(LlmUsage::new(10, 5));
        let wire = WireEnvelope::from(envelope.clone());
        assert_eq!(wire.envelope_format, WIRE_FORMAT);

        let serialized = serde_json::to_string(&wire).unwrap();
        let parsed: WireEnvelope = serde_json::from_str(&serialized).unwrap();
        let restored = Envelope::from(parsed);
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_conversation_push() {
        let mut conversation = Conversation::default();
        conversation.push(Message::system("you are concise"));
        conversation.push(Message::user("hi"));
        assert_eq!(conversation.len(), 2);
    }
}
