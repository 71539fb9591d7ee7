//! Engine error types

use dipeo_core::HandlerError;
use thiserror::Error;

/// Errors that can occur while executing a diagram.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Diagram failed structural validation.
    #[error("invalid diagram: {0}")]
    InvalidDiagram(String),

    /// A node's handler failed after retries were exhausted.
    #[error("node '{node}' failed: {error}")]
    NodeFailed {
        node: String,
        #[source]
        error: HandlerError,
    },

    /// No handler is registered for a node type.
    #[error("no handler registered for node type '{0}'")]
    NoHandler(String),

    /// A node exceeded the requeue bound while waiting for inputs.
    #[error("node '{node}' starved after {attempts} requeue attempts")]
    DependencyStarvation { node: String, attempts: u32 },

    /// Execution was cancelled from outside.
    #[error("execution aborted")]
    Aborted,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutionError {
    pub fn node_failed(node: impl Into<String>, error: HandlerError) -> Self {
        Self::NodeFailed {
            node: node.into(),
            error,
        }
    }

    /// Summary line carried on the terminal event: node, kind, message.
    pub fn summary(&self) -> String {
        match self {
            ExecutionError::NodeFailed { node, error } => {
                let kind = match error {
                    HandlerError::Validation(_) => "validation",
                    HandlerError::Transient(_) => "transient",
                    HandlerError::Fatal(_) => "fatal",
                    HandlerError::Timeout(_) => "timeout",
                };
                format!("node {node}: {kind}: {error}")
            }
            other => other.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;
