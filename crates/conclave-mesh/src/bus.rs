//! Core `MessageBus` trait and subscriber handlers

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{error::MeshResult, message::Message, metrics::BusMetrics, types::AgentId};

/// Receiver side of a subscription.
///
/// The bus invokes handlers one at a time from its delivery loop, so a
/// handler that publishes new messages only enqueues them; they are delivered
/// after it returns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message
    ///
    /// # Errors
    ///
    /// An error is logged and counted by the bus; it never stops delivery to
    /// other subscribers.
    async fn handle(&self, message: Message) -> MeshResult<()>;
}

/// Handler backed by an async closure, created with [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`]
///
/// ```rust
/// use conclave_mesh::{handler_fn, Message};
///
/// let handler = handler_fn(|message: Message| async move {
///     println!("got {}", message.id);
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = MeshResult<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = MeshResult<()>> + Send,
{
    async fn handle(&self, message: Message) -> MeshResult<()> {
        (self.f)(message).await
    }
}

/// Asynchronous publish/subscribe transport between agents
///
/// Every backend provides the same observable behavior:
///
/// - A direct message reaches exactly the handler registered under its
///   `receiver` at delivery time, or is dropped and logged.
/// - A broadcast reaches every current subscriber except its sender.
/// - Deliveries happen sequentially on one loop, FIFO per publisher.
/// - A failing handler is logged and counted; delivery continues.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Begin consuming the delivery queue
    ///
    /// # Errors
    ///
    /// Returns `MeshError` if the backend cannot be reached.
    async fn start(&self) -> MeshResult<()>;

    /// Stop consuming; later publishes fail with `MeshError::BusStopped`
    ///
    /// # Errors
    ///
    /// Returns `MeshError` if backend subscriptions cannot be released.
    async fn stop(&self) -> MeshResult<()>;

    /// Enqueue a message for asynchronous delivery
    ///
    /// Returns as soon as the message is queued (or handed to the remote
    /// backend); it does not wait for handlers.
    ///
    /// # Errors
    ///
    /// Returns `MeshError` if the bus is stopped or the backend rejects the
    /// message.
    async fn publish(&self, message: Message) -> MeshResult<()>;

    /// Register `handler` as the receiver for `agent_id`
    ///
    /// The last registration for an id wins.
    ///
    /// # Errors
    ///
    /// Returns `MeshError` if the backend subscription fails.
    async fn subscribe(&self, agent_id: &AgentId, handler: Arc<dyn MessageHandler>)
    -> MeshResult<()>;

    /// Remove the handler registered for `agent_id`, if any
    ///
    /// # Errors
    ///
    /// Returns `MeshError` if the backend subscription cannot be released.
    async fn unsubscribe(&self, agent_id: &AgentId) -> MeshResult<()>;

    /// Get current delivery counters
    async fn metrics(&self) -> BusMetrics;

    /// Wait until this process has no queued or in-flight deliveries
    ///
    /// Backends that relay through a server only see messages that have
    /// already arrived locally. Returns `false` if `timeout` elapsed first.
    async fn wait_idle(&self, timeout: Duration) -> bool;
}
