//! Tasks submitted to `Agent::process_task` and their outcomes

use conclave_mesh::{Payload, into_payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, AgentResult};

/// A unit of work for an agent
///
/// Encoded as a flat object: `{"task_type": "route_query", "query": "..."}`.
/// An absent `task_type` selects the agent's default task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(flatten)]
    pub params: Payload,
}

impl Task {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: Some(task_type.into()),
            params: Payload::new(),
        }
    }

    /// Build a task of a fixed type from a message payload
    ///
    /// A `task_type` key in the payload is discarded, so the sender cannot
    /// pick a different operation.
    pub fn from_payload(task_type: impl Into<String>, mut payload: Payload) -> Self {
        payload.remove("task_type");
        Self {
            task_type: Some(task_type.into()),
            params: payload,
        }
    }

    /// Add a parameter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Task type, falling back to `default`
    pub fn kind_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.task_type.as_deref().unwrap_or(default)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// A non-empty string parameter
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Validation` if the parameter is missing, not a
    /// string, or empty.
    pub fn require_str(&self, key: &str) -> AgentResult<&str> {
        match self.get_str(key) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(AgentError::missing(key)),
        }
    }

    pub fn get_u64_or(&self, key: &str, default: u64) -> u64 {
        self.params.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// String-list parameter; non-string entries are skipped
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.params
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Result of `process_task`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds
    pub processing_time: f64,
}

impl TaskOutcome {
    pub fn succeeded(result: Value, processing_time: f64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            processing_time,
        }
    }

    pub fn failed(error: impl Into<String>, processing_time: f64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            processing_time,
        }
    }

    /// Encode as a message payload
    pub fn to_payload(&self) -> Payload {
        into_payload(serde_json::to_value(self).unwrap_or(Value::Null))
    }
}
