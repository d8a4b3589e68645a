//! Error types for bus operations

use thiserror::Error;

/// Result type for bus operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during bus operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Connection to messaging backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish message
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Failed to subscribe an agent
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Message serialization failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Message deserialization failed
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// A subscriber's handler reported a failure
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// The bus has been stopped and no longer accepts messages
    #[error("Message bus is stopped")]
    BusStopped,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend-specific error (Redis, etc.)
    #[error("Backend error: {0}")]
    BackendError(String),
}

impl MeshError {
    /// Get the error code suitable for logging or reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshError::ConnectionFailed(_) => "CONNECTION_FAILED",
            MeshError::PublishFailed(_) => "PUBLISH_FAILED",
            MeshError::SubscribeFailed(_) => "SUBSCRIBE_FAILED",
            MeshError::SerializationFailed(_) => "SERIALIZATION_FAILED",
            MeshError::DeserializationFailed(_) => "DESERIALIZATION_FAILED",
            MeshError::HandlerFailed(_) => "HANDLER_FAILED",
            MeshError::BusStopped => "BUS_STOPPED",
            MeshError::InvalidConfig(_) => "INVALID_CONFIG",
            MeshError::BackendError(_) => "BACKEND_ERROR",
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for MeshError {
    fn from(err: redis::RedisError) -> Self {
        MeshError::BackendError(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationFailed(err.to_string())
    }
}
