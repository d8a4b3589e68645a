//! # Conclave Mesh
//!
//! Message envelope and publish/subscribe bus for Conclave agents.
//!
//! Agents exchange typed, correlated [`Message`]s over a [`MessageBus`].
//! Two backends share one delivery loop and therefore one set of semantics:
//!
//! - [`InMemoryBus`] for a single process
//! - `RedisBus` (feature `redis`) for agents spread over several processes
//!
//! ## Example
//!
//! ```rust,no_run
//! use conclave_mesh::{create_bus, AgentId, BusConfig, Message, MessageKind, into_payload};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = create_bus(&BusConfig::from_env()?).await;
//!     bus.start().await?;
//!
//!     let query = Message::direct(
//!         MessageKind::Query,
//!         AgentId::parse("rag_agent_001")?,
//!         into_payload(json!({"query": "what is a borrow checker?"})),
//!     );
//!     bus.publish(query).await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
mod dispatch;
pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis;

pub use bus::{FnHandler, MessageBus, MessageHandler, handler_fn};
pub use config::{BusBackend, BusConfig, ConfigError, create_bus};
pub use error::{MeshError, MeshResult};
pub use memory::InMemoryBus;
pub use message::{Message, MessageKind, Payload, into_payload};
pub use metrics::{BusMetrics, BusMetricsCollector};
pub use types::{AgentId, IdValidationError, MessageId};

#[cfg(feature = "redis")]
pub use redis::{RedisBus, RedisConfig};
