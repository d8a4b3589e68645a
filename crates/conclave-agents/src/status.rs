//! Lifecycle status and counters exposed by every agent

use chrono::{DateTime, Utc};
use conclave_mesh::{AgentId, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Agent lifecycle state
///
/// `Initializing → Ready ⇄ Busy`, `Ready | Busy → Error` on a handler
/// fault, and anything `→ Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Ready,
    Busy,
    Error,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Ready => "ready",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
        }
    }

    /// Whether the agent can take work
    pub fn is_operational(&self) -> bool {
        matches!(self, AgentStatus::Ready | AgentStatus::Busy)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic per-agent counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Seconds spent in `process_task`
    pub total_processing_time: f64,
}

/// Read-only view of an agent, returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub error_message: Option<String>,
    pub metrics: AgentMetrics,
    /// Role-specific fields
    #[serde(flatten)]
    pub extras: Payload,
}
