//! The `Agent` capability trait and lifecycle driving functions

use async_trait::async_trait;
use conclave_mesh::{Message, MessageHandler, MeshResult, Payload};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    core::AgentCore,
    error::{AgentError, AgentResult},
    handler::HandlerTable,
    status::{AgentStatus, StatusSnapshot},
    task::{Task, TaskOutcome},
};

/// A participant on the bus
///
/// Roles implement the few methods that differ between them and embed an
/// [`AgentCore`] for everything that does not.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use conclave_agents::{Agent, AgentCore, AgentResult, HandlerTable, Task};
/// use conclave_mesh::AgentId;
/// use serde_json::{json, Value};
///
/// struct Echo {
///     core: AgentCore,
///     handlers: HandlerTable<Echo>,
/// }
///
/// #[async_trait]
/// impl Agent for Echo {
///     fn core(&self) -> &AgentCore {
///         &self.core
///     }
///
///     fn handlers(&self) -> &HandlerTable<Self> {
///         &self.handlers
///     }
///
///     async fn execute(&self, task: Task) -> AgentResult<Value> {
///         Ok(json!({ "echo": task.params }))
///     }
/// }
///
/// let echo = Echo {
///     core: AgentCore::new(AgentId::from("echo"), "echo", ["echo"], None),
///     handlers: HandlerTable::with_defaults(),
/// };
/// # let _ = echo;
/// ```
#[async_trait]
pub trait Agent: Send + Sync + Sized + 'static {
    fn core(&self) -> &AgentCore;

    fn handlers(&self) -> &HandlerTable<Self>;

    /// Role-specific task dispatch on `task.task_type`
    ///
    /// # Errors
    ///
    /// `AgentError::UnknownOperation` for an unsupported task type,
    /// `AgentError::Validation` for missing parameters.
    async fn execute(&self, task: Task) -> AgentResult<Value>;

    /// Run a task with status, timing and counter bookkeeping
    ///
    /// Never fails: errors are reported in the returned outcome.
    async fn process_task(&self, task: Task) -> TaskOutcome {
        let started = self.core().begin_task();
        let result = self.execute(task).await;
        self.core().finish_task(started, result)
    }

    /// Called by [`start`] before the agent becomes `Ready`
    async fn on_start(&self) -> AgentResult<()> {
        Ok(())
    }

    /// Called by [`stop`] after the agent has left the bus
    async fn on_stop(&self) -> AgentResult<()> {
        Ok(())
    }

    /// Role-specific fields for the status snapshot
    fn status_extras(&self) -> Payload {
        Payload::new()
    }

    fn status(&self) -> StatusSnapshot {
        self.core().snapshot(self.status_extras())
    }

    fn is_healthy(&self) -> bool {
        self.core().is_healthy()
    }
}

/// Bring an agent online: run `on_start`, subscribe it, mark it `Ready`
///
/// # Errors
///
/// Returns the `on_start` error or the bus subscription error; the agent is
/// left in `Error` status.
pub async fn start<A: Agent>(agent: &Arc<A>) -> AgentResult<()> {
    let core = agent.core();
    core.set_status(AgentStatus::Initializing);

    let subscribed = match core.bus() {
        Some(bus) => {
            let inbox: Arc<dyn MessageHandler> = Arc::new(Inbox(Arc::clone(agent)));
            bus.subscribe(core.id(), inbox).await.map_err(AgentError::from)
        }
        None => Ok(()),
    };
    let result = match subscribed {
        Ok(()) => agent.on_start().await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        core.record_fault(&e);
        return Err(e);
    }

    core.touch_heartbeat();
    core.set_status(AgentStatus::Ready);
    info!(agent_id = %core.id(), agent_type = core.agent_type(), "Agent started");
    Ok(())
}

/// Take an agent offline: mark it `Stopped`, unsubscribe, run `on_stop`
///
/// # Errors
///
/// Returns the unsubscribe or `on_stop` error; the agent stays `Stopped`.
pub async fn stop<A: Agent>(agent: &Arc<A>) -> AgentResult<()> {
    let core = agent.core();
    core.set_status(AgentStatus::Stopped);
    if let Some(bus) = core.bus() {
        bus.unsubscribe(core.id()).await?;
    }
    agent.on_stop().await?;
    info!(agent_id = %core.id(), "Agent stopped");
    Ok(())
}

/// Dispatch one message through the agent's handler table
///
/// Handler errors are recorded on the agent (status `Error`) and never
/// propagate to the caller.
pub async fn receive_message<A: Agent>(agent: &A, message: Message) {
    let core = agent.core();
    core.record_received();
    debug!(
        agent_id = %core.id(),
        message_id = %message.id,
        message_type = %message.kind,
        "Received message"
    );

    let Some(handler) = agent.handlers().get(message.kind) else {
        warn!(
            agent_id = %core.id(),
            message_type = %message.kind,
            error_code = "UNKNOWN_OPERATION",
            "No handler for message type, dropping"
        );
        return;
    };

    if let Err(e) = handler(agent, message).await {
        core.record_fault(&e);
    }
}

/// Bus subscription for an agent
struct Inbox<A>(Arc<A>);

#[async_trait]
impl<A: Agent> MessageHandler for Inbox<A> {
    async fn handle(&self, message: Message) -> MeshResult<()> {
        receive_message(self.0.as_ref(), message).await;
        Ok(())
    }
}
