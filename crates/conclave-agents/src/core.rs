//! State shared by every agent role
//!
//! Roles embed an [`AgentCore`] and expose it through `Agent::core`. The core
//! owns identity, lifecycle status, heartbeat time and counters, and is the
//! only path by which an agent sends messages.

use chrono::{DateTime, Utc};
use conclave_mesh::{AgentId, Message, MessageBus, MessageId, Payload};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::{
    error::{AgentError, AgentResult},
    status::{AgentMetrics, AgentStatus, StatusSnapshot},
    task::TaskOutcome,
};

/// Default window within which a heartbeat keeps an agent healthy
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CoreState {
    status: AgentStatus,
    last_heartbeat: DateTime<Utc>,
    error_message: Option<String>,
    metrics: AgentMetrics,
}

/// Identity, status and counters of one agent
pub struct AgentCore {
    id: AgentId,
    agent_type: String,
    capabilities: Vec<String>,
    bus: Option<Arc<dyn MessageBus>>,
    heartbeat_timeout: Duration,
    state: Mutex<CoreState>,
}

impl AgentCore {
    pub fn new(
        id: AgentId,
        agent_type: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> Self {
        Self {
            id,
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            bus,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            state: Mutex::new(CoreState {
                status: AgentStatus::Initializing,
                last_heartbeat: Utc::now(),
                error_message: None,
                metrics: AgentMetrics::default(),
            }),
        }
    }

    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn bus(&self) -> Option<&Arc<dyn MessageBus>> {
        self.bus.as_ref()
    }

    pub fn status(&self) -> AgentStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: AgentStatus) {
        let mut state = self.lock();
        if state.status != status {
            debug!(agent_id = %self.id, from = %state.status, to = %status, "Status changed");
            state.status = status;
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.lock().metrics.clone()
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.lock().last_heartbeat
    }

    /// Refresh the heartbeat timestamp to now
    pub fn touch_heartbeat(&self) {
        self.set_last_heartbeat(Utc::now());
    }

    pub fn set_last_heartbeat(&self, at: DateTime<Utc>) {
        self.lock().last_heartbeat = at;
    }

    /// Operational and heard from within the heartbeat window
    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.lock();
        if !state.status.is_operational() {
            return false;
        }
        match (now - state.last_heartbeat).to_std() {
            Ok(elapsed) => elapsed < self.heartbeat_timeout,
            // heartbeat in the future
            Err(_) => true,
        }
    }

    /// Stamp the sender and publish
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Detached` if the agent has no bus, or the bus error.
    pub async fn send_message(&self, message: Message) -> AgentResult<MessageId> {
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| AgentError::Detached(self.id.clone()))?;

        let message = message.with_sender(self.id.clone());
        let id = message.id;
        debug!(
            agent_id = %self.id,
            message_id = %id,
            message_type = %message.kind,
            receiver_id = message.receiver.as_ref().map(AgentId::as_str).unwrap_or("broadcast"),
            "Sending message"
        );

        bus.publish(message).await?;
        let mut state = self.lock();
        state.metrics.messages_sent = state.metrics.messages_sent.saturating_add(1);
        Ok(id)
    }

    pub(crate) fn record_received(&self) {
        let mut state = self.lock();
        state.metrics.messages_received = state.metrics.messages_received.saturating_add(1);
    }

    /// Record a message-handler fault: status `Error` with the error text
    pub(crate) fn record_fault(&self, err: &AgentError) {
        error!(
            agent_id = %self.id,
            error = %err,
            error_code = err.error_code(),
            "Message handler failed"
        );
        let mut state = self.lock();
        state.status = AgentStatus::Error;
        state.error_message = Some(err.to_string());
        state.metrics.tasks_failed = state.metrics.tasks_failed.saturating_add(1);
    }

    /// Enter `Busy` and start the task clock
    pub(crate) fn begin_task(&self) -> Instant {
        self.set_status(AgentStatus::Busy);
        Instant::now()
    }

    /// Leave `Busy`, update counters and build the outcome
    pub(crate) fn finish_task(&self, started: Instant, result: AgentResult<Value>) -> TaskOutcome {
        let elapsed = started.elapsed().as_secs_f64();
        let mut state = self.lock();
        state.metrics.total_processing_time += elapsed;
        if state.status == AgentStatus::Busy {
            state.status = AgentStatus::Ready;
        }

        match result {
            Ok(value) => {
                state.metrics.tasks_completed = state.metrics.tasks_completed.saturating_add(1);
                TaskOutcome::succeeded(value, elapsed)
            }
            Err(e) => {
                state.metrics.tasks_failed = state.metrics.tasks_failed.saturating_add(1);
                drop(state);
                debug!(agent_id = %self.id, error = %e, "Task failed");
                TaskOutcome::failed(e.to_string(), elapsed)
            }
        }
    }

    pub fn snapshot(&self, extras: Payload) -> StatusSnapshot {
        let state = self.lock();
        StatusSnapshot {
            agent_id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            status: state.status,
            capabilities: self.capabilities.clone(),
            last_heartbeat: state.last_heartbeat,
            error_message: state.error_message.clone(),
            metrics: state.metrics.clone(),
            extras,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use conclave_mesh::{InMemoryBus, MessageKind};
    use serde_json::json;

    fn core() -> AgentCore {
        AgentCore::new(AgentId::from("agent-1"), "test", ["a", "b"], None)
    }

    #[test]
    fn test_health_follows_status_and_heartbeat() {
        let core = core();
        let now = Utc::now();
        core.set_last_heartbeat(now - TimeDelta::seconds(10));

        // not started yet
        assert!(!core.is_healthy_at(now));

        core.set_status(AgentStatus::Ready);
        assert!(core.is_healthy_at(now));

        core.set_last_heartbeat(now - TimeDelta::seconds(61));
        assert!(!core.is_healthy_at(now));

        core.set_last_heartbeat(now - TimeDelta::seconds(10));
        core.set_status(AgentStatus::Stopped);
        assert!(!core.is_healthy_at(now));
    }

    #[test]
    fn test_custom_heartbeat_timeout() {
        let core = core().with_heartbeat_timeout(Duration::from_secs(5));
        let now = Utc::now();
        core.set_status(AgentStatus::Busy);
        core.set_last_heartbeat(now - TimeDelta::seconds(6));
        assert!(!core.is_healthy_at(now));
    }

    #[test]
    fn test_task_accounting() {
        let core = core();
        core.set_status(AgentStatus::Ready);

        let started = core.begin_task();
        assert_eq!(core.status(), AgentStatus::Busy);
        let ok = core.finish_task(started, Ok(json!({"done": true})));
        assert!(ok.success);
        assert_eq!(core.status(), AgentStatus::Ready);

        let started = core.begin_task();
        let failed = core.finish_task(started, Err(AgentError::missing("query")));
        assert!(!failed.success);
        assert_eq!(
            failed.error.as_deref(),
            Some("Validation failed: 'query' is required")
        );
        assert_eq!(core.status(), AgentStatus::Ready);

        let metrics = core.metrics();
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert!(metrics.total_processing_time >= 0.0);
    }

    #[test]
    fn test_fault_sets_error_status() {
        let core = core();
        core.set_status(AgentStatus::Ready);
        core.record_fault(&AgentError::Handler("boom".into()));

        assert_eq!(core.status(), AgentStatus::Error);
        assert_eq!(
            core.error_message().as_deref(),
            Some("Handler failed: boom")
        );
        assert_eq!(core.metrics().tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_send_requires_bus() {
        let detached = core();
        let result = detached
            .send_message(Message::new(MessageKind::Notification, Payload::new()))
            .await;
        assert!(matches!(result, Err(AgentError::Detached(_))));

        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let attached = AgentCore::new(AgentId::from("agent-2"), "test", ["a"], Some(bus));
        attached
            .send_message(Message::new(MessageKind::Notification, Payload::new()))
            .await
            .unwrap();
        assert_eq!(attached.metrics().messages_sent, 1);
    }
}
