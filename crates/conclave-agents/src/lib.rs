//! # Conclave Agents
//!
//! Agent runtime and the roles built on it.
//!
//! Every agent embeds an [`AgentCore`] (identity, status, counters, bus
//! handle) and a [`HandlerTable`] mapping message kinds to handlers. The
//! [`Agent`] trait adds the role-specific task dispatch; [`start`],
//! [`stop`] and [`receive_message`] drive the lifecycle.
//!
//! Roles:
//!
//! - [`CoordinatorAgent`] runs query → worker → evaluator workflows
//! - [`RouterAgent`] classifies queries and load-balances them over experts
//! - [`RetrievalAgent`] answers queries from a [`Retriever`]
//! - [`EvaluatorAgent`] scores worker answers
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conclave_agents::{CoordinatorAgent, start};
//! use conclave_mesh::{AgentId, InMemoryBus, MessageBus};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
//!     bus.start().await?;
//!
//!     let coordinator = Arc::new(CoordinatorAgent::new(
//!         AgentId::parse("coordinator_001")?,
//!         Some(bus.clone()),
//!     ));
//!     start(&coordinator).await?;
//!
//!     let started = coordinator
//!         .coordinate_query("what is a borrow checker?", AgentId::parse("rag_agent_001")?, None)
//!         .await?;
//!     println!("{started}");
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod evaluator;
pub mod handler;
pub mod retrieval;
pub mod router;
pub mod status;
pub mod task;

pub use agent::{Agent, receive_message, start, stop};
pub use config::SystemConfig;
pub use coordinator::{
    CoordinationMetrics, CoordinatorAgent, CoordinatorSettings, RegisteredAgent, Workflow,
    WorkflowStatus,
};
pub use crate::core::{AgentCore, DEFAULT_HEARTBEAT_TIMEOUT};
pub use error::{AgentError, AgentResult};
pub use evaluator::{
    Evaluation, EvaluationMetrics, EvaluationRecord, EvaluationScores, EvaluatorAgent,
    LexicalScorer, Scorer,
};
pub use handler::{Handler, HandlerTable, handle_heartbeat, handle_request};
pub use retrieval::{
    Document, KeywordRetriever, QueryAnswer, RetrievalAgent, RetrievalMetrics, RetrievalSettings,
    RetrievedDocument, Retriever, Specialization,
};
pub use router::{
    ExpertRecord, ExpertRegistry, ExpertSelector, LoadBalancingStrategy, PendingRoute,
    QueryCategory, QueryClassifier, RouterAgent, RoutingMetrics,
};
pub use status::{AgentMetrics, AgentStatus, StatusSnapshot};
pub use task::{Task, TaskOutcome};
