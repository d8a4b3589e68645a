//! Message envelope exchanged between agents.
//!
//! A [`Message`] is built right before it is published and is never mutated
//! afterwards. On the wire it is a flat JSON object:
//!
//! ```json
//! {
//!   "message_id": "5f0c…",
//!   "sender_id": "coordinator",
//!   "receiver_id": "rag_agent_001",
//!   "message_type": "query",
//!   "payload": {"query": "what is rust?"},
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "correlation_id": ""
//! }
//! ```
//!
//! An empty `receiver_id` means broadcast and an empty `correlation_id` means
//! the message does not answer anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{MeshError, MeshResult};
use crate::types::{AgentId, MessageId};

/// Opaque key/value body of a message
pub type Payload = serde_json::Map<String, Value>;

/// Turn any JSON value into a payload.
///
/// Objects are used as-is; any other value is wrapped under `"value"`.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Kind of a message, used by receivers to pick a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Query,
    Response,
    Request,
    Notification,
    Heartbeat,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Query => "query",
            MessageKind::Response => "response",
            MessageKind::Request => "request",
            MessageKind::Notification => "notification",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message sent between agents over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    #[serde(rename = "message_id")]
    pub id: MessageId,
    /// Sending agent, stamped by the agent runtime on send
    #[serde(rename = "sender_id", default, with = "empty_as_none")]
    pub sender: Option<AgentId>,
    /// Recipient; `None` broadcasts to every subscriber except the sender
    #[serde(rename = "receiver_id", default, with = "empty_as_none")]
    pub receiver: Option<AgentId>,
    #[serde(rename = "message_type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// Id of the earlier message this one answers
    #[serde(default, with = "empty_as_none")]
    pub correlation_id: Option<MessageId>,
}

impl Message {
    /// Create a broadcast message of the given kind
    pub fn new(kind: MessageKind, payload: Payload) -> Self {
        Self {
            id: MessageId::new(),
            sender: None,
            receiver: None,
            kind,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Create a message addressed to a single agent
    pub fn direct(kind: MessageKind, to: AgentId, payload: Payload) -> Self {
        Self::new(kind, payload).with_receiver(to)
    }

    /// Create a reply to `incoming`: addressed to its sender and correlated to its id
    pub fn reply_to(incoming: &Message, kind: MessageKind, payload: Payload) -> Self {
        let mut reply = Self::new(kind, payload).with_correlation_id(incoming.id);
        reply.receiver = incoming.sender.clone();
        reply
    }

    pub fn with_sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_receiver(mut self, receiver: AgentId) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Set correlation ID for request/reply pattern
    pub fn with_correlation_id(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Check if this message goes to every subscriber
    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }

    /// Look up a string field of the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Serialize message to JSON
    ///
    /// # Errors
    ///
    /// Returns `MeshError::SerializationFailed` if the payload cannot be encoded.
    pub fn to_json(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize message from JSON
    ///
    /// # Errors
    ///
    /// Returns `MeshError::DeserializationFailed` for malformed input.
    pub fn from_json(json: &str) -> MeshResult<Self> {
        serde_json::from_str(json).map_err(|e| MeshError::DeserializationFailed(e.to_string()))
    }
}

/// Serde adapter that writes `None` as `""` and reads `""` or `null` back as `None`.
mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = Message::direct(
            MessageKind::Query,
            AgentId::from("rag_agent_001"),
            into_payload(json!({"query": "what is rust?"})),
        )
        .with_sender(AgentId::from("coordinator"));

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["message_id"], json!(msg.id.to_string()));
        assert_eq!(value["sender_id"], json!("coordinator"));
        assert_eq!(value["receiver_id"], json!("rag_agent_001"));
        assert_eq!(value["message_type"], json!("query"));
        assert_eq!(value["payload"]["query"], json!("what is rust?"));
        assert_eq!(value["correlation_id"], json!(""));
    }

    #[test]
    fn test_decode_foreign_message() {
        let id = MessageId::new();
        let corr = MessageId::new();
        let raw = json!({
            "message_id": id.to_string(),
            "sender_id": "evaluator_agent_001",
            "receiver_id": "",
            "message_type": "notification",
            "payload": {"evaluation": {"quality_score": 0.8}},
            "timestamp": "2025-03-01T12:00:00Z",
            "correlation_id": corr.to_string(),
        });

        let msg = Message::from_json(&raw.to_string()).unwrap();
        assert_eq!(msg.id, id);
        assert!(msg.is_broadcast());
        assert_eq!(msg.kind, MessageKind::Notification);
        assert_eq!(msg.correlation_id, Some(corr));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        let err = Message::from_json("{\"message_type\": \"query\"").unwrap_err();
        assert!(matches!(err, MeshError::DeserializationFailed(_)));
        assert_eq!(err.error_code(), "DESERIALIZATION_FAILED");

        let unknown_kind = json!({
            "message_id": MessageId::new().to_string(),
            "message_type": "gossip",
            "timestamp": "2025-03-01T12:00:00Z",
        });
        assert!(matches!(
            Message::from_json(&unknown_kind.to_string()),
            Err(MeshError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn test_decode_tolerates_missing_optional_fields() {
        let raw = json!({
            "message_id": MessageId::new().to_string(),
            "message_type": "heartbeat",
            "timestamp": "2025-03-01T12:00:00Z",
            "correlation_id": null,
        });
        let msg = Message::from_json(&raw.to_string()).unwrap();
        assert!(msg.sender.is_none());
        assert!(msg.payload.is_empty());
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn test_reply_to_swaps_addressing() {
        let request = Message::direct(
            MessageKind::Heartbeat,
            AgentId::from("router"),
            Payload::new(),
        )
        .with_sender(AgentId::from("monitor"));

        let reply = Message::reply_to(&request, MessageKind::Heartbeat, Payload::new());
        assert_eq!(reply.receiver, Some(AgentId::from("monitor")));
        assert_eq!(reply.correlation_id, Some(request.id));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn test_into_payload_wraps_scalars() {
        assert_eq!(into_payload(json!({"a": 1}))["a"], json!(1));
        assert_eq!(into_payload(json!(3))["value"], json!(3));
        assert!(into_payload(Value::Null).is_empty());
    }
}
