//! Redis pub/sub implementation of `MessageBus`
//!
//! Each agent listens on a channel named after its id plus one shared
//! broadcast channel. Messages received from Redis are funneled into the
//! same sequential delivery loop the in-memory bus uses, so handlers see
//! identical ordering and failure semantics.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    bus::{MessageBus, MessageHandler},
    dispatch::{Dispatcher, Envelope},
    error::{MeshError, MeshResult},
    message::Message,
    metrics::{BusMetrics, BusMetricsCollector},
    types::AgentId,
};

/// Name of the channel every subscriber also listens on
pub const BROADCAST_CHANNEL: &str = "broadcast";

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of publishing connections in the pool
    pub pool_size: usize,
    /// Prepended to every channel name; lets several systems share one server
    pub channel_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            channel_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }
}

/// Channel a message is published on: the receiver's id, or the broadcast channel
fn channel_for(prefix: &str, receiver: Option<&AgentId>) -> String {
    match receiver {
        Some(agent_id) => format!("{prefix}{agent_id}"),
        None => format!("{prefix}{BROADCAST_CHANNEL}"),
    }
}

/// Redis-backed message bus
pub struct RedisBus {
    pool: deadpool_redis::Pool,
    client: redis::Client,
    config: RedisConfig,
    dispatcher: Arc<Dispatcher>,
    /// Active subscriptions (agent -> forwarding task)
    subscriptions: Arc<RwLock<HashMap<AgentId, JoinHandle<()>>>>,
}

impl RedisBus {
    /// Connect with default configuration
    pub async fn new(url: impl Into<String>) -> MeshResult<Self> {
        Self::with_config(RedisConfig::new(url)).await
    }

    /// Connect with custom configuration
    ///
    /// # Errors
    ///
    /// Returns `MeshError::InvalidConfig` for an unparsable URL or an empty
    /// pool, and `MeshError::ConnectionFailed` if the server does not answer
    /// PING.
    pub async fn with_config(config: RedisConfig) -> MeshResult<Self> {
        if config.pool_size == 0 {
            return Err(MeshError::InvalidConfig(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| MeshError::InvalidConfig(format!("{}: {}", config.url, e)))?;

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("PING failed: {}", e)))?;

        debug!(url = %config.url, "Redis bus connected");

        let metrics = BusMetricsCollector::new("redis", Some(config.url.clone()));
        Ok(Self {
            pool,
            client,
            config,
            dispatcher: Arc::new(Dispatcher::new(metrics)),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn get_connection(&self) -> MeshResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))
    }

    fn channel(&self, receiver: Option<&AgentId>) -> String {
        channel_for(&self.config.channel_prefix, receiver)
    }

    /// Forward remote messages for one agent into the local delivery queue
    /// Pub/sub connection joined to the agent's own and the broadcast channel
    async fn open_pubsub(&self, agent_id: &AgentId) -> MeshResult<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))?;

        for channel in [self.channel(Some(agent_id)), self.channel(None)] {
            pubsub
                .subscribe(&channel)
                .await
                .map_err(|e| MeshError::SubscribeFailed(e.to_string()))?;
        }
        Ok(pubsub)
    }

    fn spawn_forwarder(&self, agent_id: AgentId, pubsub: redis::aio::PubSub) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let broadcast = self.channel(None);

        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        let err = MeshError::from(e);
                        error!(
                            agent_id = %agent_id,
                            error = %err,
                            error_code = err.error_code(),
                            "Failed to get message payload"
                        );
                        dispatcher.metrics().record_backend_error().await;
                        continue;
                    }
                };

                let message = match Message::from_json(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(
                            agent_id = %agent_id,
                            error = %e,
                            error_code = e.error_code(),
                            "Failed to decode message"
                        );
                        dispatcher.metrics().record_backend_error().await;
                        continue;
                    }
                };

                if msg.get_channel_name() == broadcast && message.sender.as_ref() == Some(&agent_id)
                {
                    continue;
                }

                let envelope = Envelope::Addressed {
                    to: agent_id.clone(),
                    message,
                };
                if let Err(e) = dispatcher.enqueue(envelope).await {
                    debug!(agent_id = %agent_id, error = %e, "Discarding remote message");
                }
            }
            warn!(agent_id = %agent_id, "Redis subscription stream ended");
        })
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.dispatcher.halt();
        if let Ok(subscriptions) = self.subscriptions.try_read() {
            for handle in subscriptions.values() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn start(&self) -> MeshResult<()> {
        self.dispatcher.start();
        info!(backend = "redis", url = %self.config.url, "Message bus started");
        Ok(())
    }

    async fn stop(&self) -> MeshResult<()> {
        self.dispatcher.halt();
        info!(backend = "redis", "Message bus stopped");
        Ok(())
    }

    async fn publish(&self, message: Message) -> MeshResult<()> {
        if self.dispatcher.is_stopped() {
            return Err(MeshError::BusStopped);
        }

        let channel = self.channel(message.receiver.as_ref());
        let json = message.to_json()?;

        let mut conn = self.get_connection().await?;
        let receivers: i64 = match conn.publish::<_, _, i64>(&channel, json).await {
            Ok(receivers) => receivers,
            Err(e) => {
                self.dispatcher.metrics().record_backend_error().await;
                return Err(MeshError::PublishFailed(e.to_string()));
            }
        };

        let metrics = self.dispatcher.metrics();
        metrics.record_publish().await;
        if receivers == 0 && !message.is_broadcast() {
            warn!(
                channel = %channel,
                message_id = %message.id,
                "No subscriber for direct message, dropping"
            );
            metrics.record_drop().await;
        }

        debug!(channel = %channel, message_id = %message.id, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        agent_id: &AgentId,
        handler: Arc<dyn MessageHandler>,
    ) -> MeshResult<()> {
        let mut subscriptions = self.subscriptions.write().await;

        // The old forwarder must be gone before the new channels are joined,
        // otherwise both could forward the same publish.
        if let Some(previous) = subscriptions.remove(agent_id) {
            previous.abort();
            let _ = previous.await;
            debug!(agent_id = %agent_id, "Replaced previous Redis subscription");
        }

        let pubsub = match self.open_pubsub(agent_id).await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                self.dispatcher.remove(agent_id).await;
                return Err(e);
            }
        };

        self.dispatcher.register(agent_id, handler).await;
        let handle = self.spawn_forwarder(agent_id.clone(), pubsub);
        subscriptions.insert(agent_id.clone(), handle);

        debug!(agent_id = %agent_id, "Subscribed to Redis channels");
        Ok(())
    }

    async fn unsubscribe(&self, agent_id: &AgentId) -> MeshResult<()> {
        if let Some(handle) = self.subscriptions.write().await.remove(agent_id) {
            handle.abort();
            debug!(agent_id = %agent_id, "Unsubscribed from Redis channels");
        } else {
            warn!(
                agent_id = %agent_id,
                "Attempted to unsubscribe but no subscription found"
            );
        }
        self.dispatcher.remove(agent_id).await;
        Ok(())
    }

    async fn metrics(&self) -> BusMetrics {
        self.dispatcher.snapshot().await
    }

    /// Wait for the local delivery queue to drain
    ///
    /// Only messages already received from Redis are covered. A publish
    /// still travelling through the server is not, so callers that need it
    /// delivered should allow for the round trip first.
    async fn wait_idle(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_idle(timeout).await
    }
}
