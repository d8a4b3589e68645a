//! # Conclave
//!
//! Message bus and coordinating agents for multi-agent retrieval systems.
//!
//! ## Core Components
//!
//! - **[MessageBus]**: publish/subscribe transport with in-memory and Redis backends
//! - **[Agent]**: lifecycle, status and message dispatch shared by every role
//! - **[CoordinatorAgent]**: two-hop workflows from worker to evaluator
//! - **[RouterAgent]**: query classification and load-balanced expert dispatch
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conclave_workspace::{
//!     Agent, AgentId, InMemoryBus, KeywordRetriever, LoadBalancingStrategy, MessageBus,
//!     RetrievalAgent, RouterAgent, start,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
//!     bus.start().await?;
//!
//!     let expert = Arc::new(RetrievalAgent::new(
//!         AgentId::parse("rag_agent_001")?,
//!         Some(bus.clone()),
//!         Arc::new(KeywordRetriever::with_texts(["Tokio is an async runtime."])),
//!     ));
//!     start(&expert).await?;
//!
//!     let router = Arc::new(RouterAgent::new(
//!         AgentId::parse("router_001")?,
//!         Some(bus.clone()),
//!         LoadBalancingStrategy::RoundRobin,
//!     ));
//!     start(&router).await?;
//!     router.register_expert(expert.core().id().clone(), vec!["general".into()], Default::default());
//!
//!     let routed = router.route_query("what is tokio?", AgentId::parse("client")?).await?;
//!     println!("{routed}");
//!     Ok(())
//! }
//! ```

pub use conclave_agents as agents;
pub use conclave_mesh as mesh;

pub use conclave_mesh::{
    AgentId, BusConfig, InMemoryBus, MeshError, MeshResult, Message, MessageBus, MessageHandler,
    MessageId, MessageKind, Payload, create_bus, handler_fn, into_payload,
};

#[cfg(feature = "redis")]
pub use conclave_mesh::{RedisBus, RedisConfig};

pub use conclave_agents::{
    Agent, AgentCore, AgentError, AgentResult, AgentStatus, CoordinatorAgent, EvaluatorAgent,
    KeywordRetriever, LoadBalancingStrategy, QueryCategory, RetrievalAgent, RouterAgent,
    SystemConfig, Task, TaskOutcome, Workflow, WorkflowStatus, receive_message, start, stop,
};
