//! Error types for agents.

use conclave_mesh::{AgentId, MeshError};
use thiserror::Error;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised while an agent handles a task or message.
///
/// None of these escape the agent that raised them: task errors become a
/// failed `TaskOutcome`, message-handler errors put the agent in the
/// `Error` status.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A required field is missing or malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The task type or request type is not known to this agent.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A message handler failed while processing a message.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// The retrieval collaborator failed.
    #[error("Retriever error: {0}")]
    Retriever(String),

    /// The agent was built without a bus and tried to send.
    #[error("Agent {0} is not attached to a message bus")]
    Detached(AgentId),

    /// Bus error.
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AgentError {
    /// Get the error code suitable for logging or reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "VALIDATION_ERROR",
            AgentError::UnknownOperation(_) => "UNKNOWN_OPERATION",
            AgentError::Handler(_) => "HANDLER_FAULT",
            AgentError::Retriever(_) => "RETRIEVER_ERROR",
            AgentError::Detached(_) => "DETACHED",
            AgentError::Mesh(e) => e.error_code(),
            AgentError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub(crate) fn missing(field: &str) -> Self {
        AgentError::Validation(format!("'{field}' is required"))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}
