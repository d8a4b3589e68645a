//! Identifier types shared by every bus participant

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error type for ID validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// The ID string is empty
    Empty,
    /// The ID has leading or trailing whitespace
    LeadingTrailingWhitespace,
    /// The ID contains invalid characters
    InvalidCharacters,
    /// The ID is not a UUID
    NotUuid(String),
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "ID cannot be empty"),
            Self::LeadingTrailingWhitespace => {
                write!(f, "ID cannot have leading or trailing whitespace")
            }
            Self::InvalidCharacters => write!(
                f,
                "ID can only contain alphanumeric characters, hyphens, underscores, and dots"
            ),
            Self::NotUuid(reason) => write!(f, "ID is not a valid UUID: {reason}"),
        }
    }
}

impl std::error::Error for IdValidationError {}

/// Unique identifier of an agent on the bus
///
/// Agent ids double as direct-delivery addresses, so they are restricted to
/// characters that are safe in Redis channel names:
/// - Non-empty
/// - No leading/trailing whitespace
/// - Only alphanumeric, hyphens, underscores, dots
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Parse and validate an agent ID from a string
    ///
    /// # Examples
    ///
    /// ```
    /// use conclave_mesh::AgentId;
    ///
    /// assert!(AgentId::parse("rag_agent_001").is_ok());
    /// assert!(AgentId::parse("expert-a.eu").is_ok());
    ///
    /// assert!(AgentId::parse("").is_err());
    /// assert!(AgentId::parse(" agent").is_err());
    /// assert!(AgentId::parse("agent/path").is_err());
    /// ```
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();

        if s.is_empty() {
            return Err(IdValidationError::Empty);
        }

        if s != s.trim() {
            return Err(IdValidationError::LeadingTrailingWhitespace);
        }

        if !s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(IdValidationError::InvalidCharacters);
        }

        Ok(Self(s.to_string()))
    }

    /// Get the agent ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AgentId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl From<&str> for AgentId {
    /// Creates an AgentId from a string slice.
    ///
    /// # Panics
    /// Panics if the string fails validation. For non-panicking construction,
    /// use `AgentId::parse()` instead.
    fn from(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|e| panic!("Invalid AgentId '{}': {}", s, e))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique message identifier (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id received from another process
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();
        if s.is_empty() {
            return Err(IdValidationError::Empty);
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdValidationError::NotUuid(e.to_string()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for MessageId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_validation() {
        assert!(AgentId::parse("coordinator").is_ok());
        assert!(AgentId::parse("expert_1.b-2").is_ok());

        assert_eq!(AgentId::parse(""), Err(IdValidationError::Empty));
        assert_eq!(
            AgentId::parse("agent "),
            Err(IdValidationError::LeadingTrailingWhitespace)
        );
        assert_eq!(
            AgentId::parse("agent:1"),
            Err(IdValidationError::InvalidCharacters)
        );
    }

    #[test]
    fn test_agent_id_serde_rejects_invalid() {
        let ok: AgentId = serde_json::from_str("\"router\"").unwrap();
        assert_eq!(ok.as_str(), "router");

        let err = serde_json::from_str::<AgentId>("\"bad id\"");
        assert!(err.is_err());
    }

    #[test]
    #[should_panic(expected = "Invalid AgentId")]
    fn test_agent_id_from_panics_on_invalid() {
        let _ = AgentId::from("with space");
    }

    #[test]
    fn test_message_id_uniqueness_and_parse() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);

        let parsed = MessageId::parse(a.to_string()).unwrap();
        assert_eq!(parsed, a);
        assert!(matches!(
            MessageId::parse("not-a-uuid"),
            Err(IdValidationError::NotUuid(_))
        ));
        assert_eq!(MessageId::parse(""), Err(IdValidationError::Empty));
    }
}
