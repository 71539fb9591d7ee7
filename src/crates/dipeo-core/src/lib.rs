//! Domain model for the DiPeO execution core
//!
//! This crate defines the types shared by the execution engine and the state
//! store: the resolved diagram (nodes and edges), the envelope payloads nodes
//! produce, the durable execution state, domain events, and the node-handler
//! contract. It performs no I/O of its own.

pub mod diagram;
pub mod envelope;
pub mod events;
pub mod handler;
pub mod state;

pub use diagram::{
    Branch, ContentType, Edge, ExecutableDiagram, HandleMode, Node, NodeId, NodeType,
};
pub use envelope::{Conversation, Envelope, EnvelopeBody, Message, WireEnvelope, WIRE_FORMAT};
pub use events::{DomainEvent, EventScope, EventSink, EventType, MemorySink, NullSink};
pub use handler::{
    EchoLlm, HandlerContext, HandlerError, InputValue, Inputs, LlmCapability, LlmReply,
    NodeHandler,
};
pub use state::{ExecutionId, ExecutionState, LlmUsage, NodeState, Status};
