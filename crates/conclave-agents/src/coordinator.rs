//! Workflow coordinator
//!
//! Chains a query across two agents: the query goes to a retrieval worker,
//! the worker's response is forwarded to an evaluator, and the evaluator's
//! notification closes the workflow. Workflows are keyed by the id of the
//! query message; the worker response id and forwarded-message id are kept
//! as aliases so a notification correlated to any of them finds its workflow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_mesh::{AgentId, Message, MessageBus, MessageId, MessageKind, Payload, into_payload};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    agent::Agent,
    core::AgentCore,
    error::{AgentError, AgentResult},
    handler::HandlerTable,
    task::Task,
};

/// Number of finished workflows kept for status queries
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

pub const COORDINATOR_CAPABILITIES: [&str; 4] = [
    "workflow_coordination",
    "agent_orchestration",
    "query_routing",
    "result_aggregation",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Started,
    RagComplete,
    EvaluationComplete,
    Completed,
    Failed,
}

/// One query's trip through worker and evaluator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub query: String,
    pub start_time: DateTime<Utc>,
    pub status: WorkflowStatus,
    pub rag_agent_id: AgentId,
    pub evaluator_agent_id: Option<AgentId>,
    pub query_message_id: MessageId,
    pub rag_response_message_id: Option<MessageId>,
    pub forward_message_id: Option<MessageId>,
    pub rag_response: Option<Payload>,
    pub evaluation: Option<Value>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds from start to completion
    pub duration: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinationMetrics {
    pub workflows_started: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    /// Running mean over completed workflows, in seconds
    pub average_workflow_time: f64,
}

/// An agent announced to the coordinator via `register_agent`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredAgent {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// Defaults applied when a task does not name its agents
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub default_worker: AgentId,
    pub default_evaluator: Option<AgentId>,
    pub history_capacity: usize,
    /// `top_k` sent to the worker with each query
    pub top_k: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_worker: AgentId::from("rag_agent_001"),
            default_evaluator: Some(AgentId::from("evaluator_agent_001")),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            top_k: 5,
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    /// Keyed by query message id
    active: HashMap<MessageId, Workflow>,
    /// Worker response id / forwarded message id -> query message id
    aliases: HashMap<MessageId, MessageId>,
    completed: VecDeque<Workflow>,
    metrics: CoordinationMetrics,
    agents: HashMap<AgentId, RegisteredAgent>,
    sequence: u64,
}

impl CoordinatorState {
    fn resolve(&self, correlation_id: MessageId) -> Option<MessageId> {
        if self.active.contains_key(&correlation_id) {
            Some(correlation_id)
        } else {
            self.aliases.get(&correlation_id).copied()
        }
    }
}

/// Agent that runs query → worker → evaluator workflows
pub struct CoordinatorAgent {
    core: AgentCore,
    handlers: HandlerTable<Self>,
    settings: CoordinatorSettings,
    state: Mutex<CoordinatorState>,
}

impl CoordinatorAgent {
    pub const AGENT_TYPE: &'static str = "coordinator";

    pub fn new(id: AgentId, bus: Option<Arc<dyn MessageBus>>) -> Self {
        Self::with_settings(id, bus, CoordinatorSettings::default())
    }

    pub fn with_settings(
        id: AgentId,
        bus: Option<Arc<dyn MessageBus>>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            core: AgentCore::new(id, Self::AGENT_TYPE, COORDINATOR_CAPABILITIES, bus),
            handlers: HandlerTable::with_defaults()
                .on(MessageKind::Query, handle_query)
                .on(MessageKind::Response, handle_response)
                .on(MessageKind::Notification, handle_notification),
            settings,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Override how long a heartbeat keeps this agent healthy
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_heartbeat_timeout(timeout);
        self
    }

    /// Start a workflow and send the query to `worker`
    ///
    /// Returns immediately with `{workflow_id, status: "in_progress"}`; the
    /// rest of the workflow advances as responses arrive.
    ///
    /// # Errors
    ///
    /// Returns the send error; the workflow is then recorded as failed.
    pub async fn coordinate_query(
        &self,
        query: &str,
        worker: AgentId,
        evaluator: Option<AgentId>,
    ) -> AgentResult<Value> {
        let workflow_id = {
            let mut state = self.lock();
            state.sequence += 1;
            format!(
                "workflow_{}_{}",
                Utc::now().timestamp_millis(),
                state.sequence
            )
        };

        let payload = json!({
            "query": query,
            "top_k": self.settings.top_k,
            "use_cache": true,
            "workflow_id": workflow_id,
        });
        let message = Message::direct(MessageKind::Query, worker.clone(), into_payload(payload));
        let query_message_id = message.id;

        {
            let mut state = self.lock();
            state.active.insert(
                query_message_id,
                Workflow {
                    workflow_id: workflow_id.clone(),
                    query: query.to_string(),
                    start_time: Utc::now(),
                    status: WorkflowStatus::Started,
                    rag_agent_id: worker.clone(),
                    evaluator_agent_id: evaluator.clone(),
                    query_message_id,
                    rag_response_message_id: None,
                    forward_message_id: None,
                    rag_response: None,
                    evaluation: None,
                    end_time: None,
                    duration: None,
                    error: None,
                },
            );
            state.metrics.workflows_started += 1;
        }

        info!(
            workflow_id = %workflow_id,
            worker = %worker,
            evaluator = evaluator.as_ref().map(AgentId::as_str).unwrap_or("none"),
            "Workflow started"
        );

        if let Err(e) = self.core.send_message(message).await {
            self.finish(
                query_message_id,
                WorkflowStatus::Failed,
                Some(e.to_string()),
            );
            return Err(e);
        }

        Ok(json!({
            "workflow_id": workflow_id,
            "status": "in_progress",
            "query_message_id": query_message_id.to_string(),
        }))
    }

    /// Look a workflow up among active, then completed workflows
    ///
    /// A found workflow is reported with `state` set to `active` or
    /// `completed`.
    pub fn get_workflow_status(&self, workflow_id: &str) -> Value {
        let state = self.lock();
        if let Some(workflow) = state.active.values().find(|w| w.workflow_id == workflow_id) {
            return json!({ "found": true, "state": "active", "workflow": workflow });
        }
        match state
            .completed
            .iter()
            .rev()
            .find(|w| w.workflow_id == workflow_id)
        {
            Some(workflow) => json!({ "found": true, "state": "completed", "workflow": workflow }),
            None => json!({ "found": false, "workflow_id": workflow_id }),
        }
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        let state = self.lock();
        state
            .active
            .values()
            .find(|w| w.workflow_id == workflow_id)
            .or_else(|| {
                state
                    .completed
                    .iter()
                    .rev()
                    .find(|w| w.workflow_id == workflow_id)
            })
            .cloned()
    }

    /// Finished workflows, oldest first
    pub fn completed_workflows(&self) -> Vec<Workflow> {
        self.lock().completed.iter().cloned().collect()
    }

    pub fn active_workflow_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn coordination_metrics(&self) -> CoordinationMetrics {
        self.lock().metrics.clone()
    }

    /// Record an agent in the coordinator's registry
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        agent_type: &str,
        capabilities: Vec<String>,
    ) -> Value {
        info!(agent_id = %agent_id, agent_type, "Registered agent");
        let record = RegisteredAgent {
            agent_id: agent_id.clone(),
            agent_type: agent_type.to_string(),
            capabilities,
            registered_at: Utc::now(),
        };
        self.lock().agents.insert(agent_id.clone(), record);
        json!({ "registered": true, "agent_id": agent_id })
    }

    pub fn registered_agents(&self) -> Vec<RegisteredAgent> {
        let mut agents: Vec<_> = self.lock().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Move a workflow out of the active set into history
    fn finish(&self, key: MessageId, status: WorkflowStatus, error: Option<String>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(mut workflow) = state.active.remove(&key) else {
            return;
        };
        state.aliases.retain(|_, target| *target != key);

        let end_time = Utc::now();
        let duration = (end_time - workflow.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        workflow.end_time = Some(end_time);
        workflow.duration = Some(duration);
        workflow.status = status;
        workflow.error = error;

        match status {
            WorkflowStatus::Failed => {
                state.metrics.workflows_failed += 1;
                warn!(
                    workflow_id = %workflow.workflow_id,
                    error = workflow.error.as_deref().unwrap_or(""),
                    "Workflow failed"
                );
            }
            _ => {
                let metrics = &mut state.metrics;
                metrics.workflows_completed += 1;
                let n = metrics.workflows_completed as f64;
                metrics.average_workflow_time += (duration - metrics.average_workflow_time) / n;
                info!(
                    workflow_id = %workflow.workflow_id,
                    duration_secs = duration,
                    "Workflow completed"
                );
            }
        }

        state.completed.push_back(workflow);
        while state.completed.len() > self.settings.history_capacity {
            state.completed.pop_front();
        }
    }

    fn agent_param(task: &Task, key: &str) -> AgentResult<Option<AgentId>> {
        match task.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => AgentId::parse(s)
                .map(Some)
                .map_err(|e| AgentError::Validation(format!("invalid {key}: {e}"))),
            Some(_) => Err(AgentError::Validation(format!("{key} must be a string"))),
        }
    }

    async fn on_query(&self, message: Message) -> AgentResult<()> {
        let task = Task::from_payload("coordinate_query", message.payload.clone());
        let outcome = self.process_task(task).await;
        self.core
            .send_message(Message::reply_to(
                &message,
                MessageKind::Response,
                outcome.to_payload(),
            ))
            .await?;
        Ok(())
    }

    async fn on_response(&self, message: Message) -> AgentResult<()> {
        let Some(correlation_id) = message.correlation_id else {
            warn!(message_id = %message.id, "Response without correlation id, dropping");
            return Ok(());
        };

        let (key, forward) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(key) = state.resolve(correlation_id) else {
                warn!(
                    correlation_id = %correlation_id,
                    "No workflow for response, dropping"
                );
                return Ok(());
            };
            let Some(workflow) = state.active.get_mut(&key) else {
                return Ok(());
            };

            if message.sender.as_ref() != Some(&workflow.rag_agent_id) {
                warn!(
                    workflow_id = %workflow.workflow_id,
                    sender = message.sender.as_ref().map(AgentId::as_str).unwrap_or(""),
                    "Response from unexpected agent, ignoring"
                );
                return Ok(());
            }
            if workflow.status != WorkflowStatus::Started {
                debug!(workflow_id = %workflow.workflow_id, "Duplicate worker response, ignoring");
                return Ok(());
            }

            workflow.rag_response = Some(message.payload.clone());
            workflow.rag_response_message_id = Some(message.id);
            workflow.status = WorkflowStatus::RagComplete;
            debug!(workflow_id = %workflow.workflow_id, "Worker response received");

            let forward = workflow.evaluator_agent_id.clone().map(|evaluator| {
                let forward =
                    Message::direct(MessageKind::Response, evaluator, message.payload.clone())
                        .with_correlation_id(message.id);
                workflow.forward_message_id = Some(forward.id);
                forward
            });

            state.aliases.insert(message.id, key);
            if let Some(forward) = &forward {
                state.aliases.insert(forward.id, key);
            }
            (key, forward)
        };

        match forward {
            Some(forward) => {
                if let Err(e) = self.core.send_message(forward).await {
                    self.finish(key, WorkflowStatus::Failed, Some(e.to_string()));
                    return Err(e);
                }
            }
            None => self.finish(key, WorkflowStatus::Completed, None),
        }
        Ok(())
    }

    async fn on_notification(&self, message: Message) -> AgentResult<()> {
        let Some(correlation_id) = message.correlation_id else {
            warn!(message_id = %message.id, "Notification without correlation id, dropping");
            return Ok(());
        };

        let key = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(key) = state.resolve(correlation_id) else {
                warn!(
                    correlation_id = %correlation_id,
                    "No workflow for notification, dropping"
                );
                return Ok(());
            };
            let Some(workflow) = state.active.get_mut(&key) else {
                return Ok(());
            };

            let evaluation = message
                .payload
                .get("evaluation")
                .cloned()
                .unwrap_or_else(|| Value::Object(message.payload.clone()));
            workflow.evaluation = Some(evaluation);
            workflow.status = WorkflowStatus::EvaluationComplete;
            key
        };

        self.finish(key, WorkflowStatus::Completed, None);
        Ok(())
    }
}

#[async_trait]
impl Agent for CoordinatorAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn handlers(&self) -> &HandlerTable<Self> {
        &self.handlers
    }

    async fn execute(&self, task: Task) -> AgentResult<Value> {
        match task.kind_or("coordinate_query") {
            "coordinate_query" => {
                let query = task.require_str("query")?;
                let worker = Self::agent_param(&task, "rag_agent_id")?
                    .unwrap_or_else(|| self.settings.default_worker.clone());
                let evaluator = match task.get("evaluator_agent_id") {
                    None => self.settings.default_evaluator.clone(),
                    Some(_) => Self::agent_param(&task, "evaluator_agent_id")?,
                };
                self.coordinate_query(query, worker, evaluator).await
            }
            "register_agent" => {
                let agent_id = AgentId::parse(task.require_str("agent_id")?)
                    .map_err(|e| AgentError::Validation(format!("invalid agent_id: {e}")))?;
                let agent_type = task.require_str("agent_type")?;
                Ok(self.register_agent(agent_id, agent_type, task.get_str_list("capabilities")))
            }
            "get_workflow_status" => {
                let workflow_id = task.require_str("workflow_id")?;
                Ok(self.get_workflow_status(workflow_id))
            }
            other => Err(AgentError::UnknownOperation(format!("task type '{other}'"))),
        }
    }

    fn status_extras(&self) -> Payload {
        let state = self.lock();
        let mut agents: Vec<&AgentId> = state.agents.keys().collect();
        agents.sort();
        into_payload(json!({
            "coordination_metrics": state.metrics,
            "active_workflows": state.active.len(),
            "completed_workflows": state.completed.len(),
            "registered_agents": state.agents.len(),
            "agents": agents,
        }))
    }
}

fn handle_query(agent: &CoordinatorAgent, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_query(message))
}

fn handle_response(agent: &CoordinatorAgent, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_response(message))
}

fn handle_notification(
    agent: &CoordinatorAgent,
    message: Message,
) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_notification(message))
}
