//! In-process implementation of `MessageBus`

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    bus::{MessageBus, MessageHandler},
    dispatch::{Dispatcher, Envelope},
    error::MeshResult,
    message::Message,
    metrics::{BusMetrics, BusMetricsCollector},
    types::AgentId,
};

/// Bus that queues messages in memory and delivers them on one background task
///
/// # Example
///
/// ```rust
/// use conclave_mesh::{handler_fn, AgentId, InMemoryBus, Message, MessageBus, MessageKind, Payload};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// bus.start().await?;
///
/// let inbox = AgentId::parse("inbox")?;
/// bus.subscribe(&inbox, Arc::new(handler_fn(|_msg| async { Ok(()) }))).await?;
/// bus.publish(Message::direct(MessageKind::Query, inbox, Payload::new())).await?;
///
/// assert!(bus.wait_idle(Duration::from_secs(1)).await);
/// assert_eq!(bus.metrics().await.delivered, 1);
/// # Ok(())
/// # }
/// ```
pub struct InMemoryBus {
    dispatcher: Arc<Dispatcher>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(BusMetricsCollector::new("in_memory", None))),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryBus {
    fn drop(&mut self) {
        self.dispatcher.halt();
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn start(&self) -> MeshResult<()> {
        self.dispatcher.start();
        info!(backend = "in_memory", "Message bus started");
        Ok(())
    }

    async fn stop(&self) -> MeshResult<()> {
        self.dispatcher.halt();
        info!(backend = "in_memory", "Message bus stopped");
        Ok(())
    }

    async fn publish(&self, message: Message) -> MeshResult<()> {
        debug!(
            message_id = %message.id,
            message_type = %message.kind,
            receiver_id = message.receiver.as_ref().map(AgentId::as_str).unwrap_or("broadcast"),
            "Publishing message"
        );
        self.dispatcher.enqueue(Envelope::Routed(message)).await?;
        self.dispatcher.metrics().record_publish().await;
        Ok(())
    }

    async fn subscribe(
        &self,
        agent_id: &AgentId,
        handler: Arc<dyn MessageHandler>,
    ) -> MeshResult<()> {
        if self.dispatcher.register(agent_id, handler).await {
            debug!(agent_id = %agent_id, "Replaced existing subscription");
        } else {
            debug!(agent_id = %agent_id, "Subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, agent_id: &AgentId) -> MeshResult<()> {
        if self.dispatcher.remove(agent_id).await {
            debug!(agent_id = %agent_id, "Unsubscribed");
        }
        Ok(())
    }

    async fn metrics(&self) -> BusMetrics {
        self.dispatcher.snapshot().await
    }

    async fn wait_idle(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_idle(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::handler_fn,
        error::MeshError,
        message::{MessageKind, Payload, into_payload},
    };
    use serde_json::json;
    use std::sync::Mutex;

    type Inbox = Arc<Mutex<Vec<Message>>>;

    fn recorder(inbox: &Inbox) -> Arc<dyn MessageHandler> {
        let inbox = Arc::clone(inbox);
        Arc::new(handler_fn(move |msg: Message| {
            let inbox = Arc::clone(&inbox);
            async move {
                inbox.lock().unwrap().push(msg);
                Ok(())
            }
        }))
    }

    async fn started_bus() -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.start().await.unwrap();
        bus
    }

    #[tokio::test]
    async fn test_direct_delivery_reaches_only_receiver() {
        let bus = started_bus().await;
        let a: Inbox = Arc::default();
        let b: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("a"), recorder(&a)).await.unwrap();
        bus.subscribe(&AgentId::from("b"), recorder(&b)).await.unwrap();

        let msg = Message::direct(MessageKind::Query, AgentId::from("a"), Payload::new());
        bus.publish(msg.clone()).await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(a.lock().unwrap().as_slice(), &[msg]);
        assert!(b.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let bus = started_bus().await;
        let inboxes: Vec<Inbox> = (0..3).map(|_| Arc::default()).collect();
        for (i, inbox) in inboxes.iter().enumerate() {
            bus.subscribe(
                &AgentId::parse(format!("agent-{i}")).unwrap(),
                recorder(inbox),
            )
            .await
            .unwrap();
        }

        let msg = Message::new(MessageKind::Notification, Payload::new())
            .with_sender(AgentId::from("agent-0"));
        bus.publish(msg).await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)).await);

        assert!(inboxes[0].lock().unwrap().is_empty());
        assert_eq!(inboxes[1].lock().unwrap().len(), 1);
        assert_eq!(inboxes[2].lock().unwrap().len(), 1);
        assert_eq!(bus.metrics().await.delivered, 2);
    }

    #[tokio::test]
    async fn test_direct_without_subscriber_is_dropped() {
        let bus = started_bus().await;
        let msg = Message::direct(MessageKind::Query, AgentId::from("ghost"), Payload::new());
        bus.publish(msg).await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)).await);

        let metrics = bus.metrics().await;
        assert_eq!(metrics.published, 1);
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.delivered, 0);
    }

    #[tokio::test]
    async fn test_fifo_per_receiver() {
        let bus = started_bus().await;
        let inbox: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("sink"), recorder(&inbox)).await.unwrap();

        for n in 0..20 {
            let msg = Message::direct(
                MessageKind::Query,
                AgentId::from("sink"),
                into_payload(json!({"n": n})),
            )
            .with_sender(AgentId::from("source"));
            bus.publish(msg).await.unwrap();
        }
        assert!(bus.wait_idle(Duration::from_secs(1)).await);

        let seen: Vec<i64> = inbox
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_do_not_stop_loop() {
        let bus = started_bus().await;
        bus.subscribe(
            &AgentId::from("erring"),
            Arc::new(handler_fn(|_msg: Message| async {
                Err(MeshError::HandlerFailed("boom".into()))
            })),
        )
        .await
        .unwrap();
        bus.subscribe(
            &AgentId::from("panicking"),
            Arc::new(handler_fn(|msg: Message| async move {
                if msg.payload.is_empty() {
                    panic!("handler exploded");
                }
                Ok(())
            })),
        )
        .await
        .unwrap();
        let healthy: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("healthy"), recorder(&healthy)).await.unwrap();

        for target in ["erring", "panicking", "healthy"] {
            bus.publish(Message::direct(
                MessageKind::Query,
                AgentId::from(target),
                Payload::new(),
            ))
            .await
            .unwrap();
        }
        assert!(bus.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(healthy.lock().unwrap().len(), 1);
        let metrics = bus.metrics().await;
        assert_eq!(metrics.delivery_failures, 2);
        assert_eq!(metrics.delivered, 1);
    }

    #[tokio::test]
    async fn test_last_subscription_wins_and_unsubscribe() {
        let bus = started_bus().await;
        let first: Inbox = Arc::default();
        let second: Inbox = Arc::default();
        let id = AgentId::from("worker");
        bus.subscribe(&id, recorder(&first)).await.unwrap();
        bus.subscribe(&id, recorder(&second)).await.unwrap();
        assert_eq!(bus.metrics().await.active_subscribers, 1);

        bus.publish(Message::direct(MessageKind::Query, id.clone(), Payload::new()))
            .await
            .unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)).await);
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);

        bus.unsubscribe(&id).await.unwrap();
        assert_eq!(bus.metrics().await.active_subscribers, 0);
    }

    #[tokio::test]
    async fn test_publish_after_stop_fails() {
        let bus = started_bus().await;
        bus.stop().await.unwrap();
        let result = bus
            .publish(Message::new(MessageKind::Heartbeat, Payload::new()))
            .await;
        assert!(matches!(result, Err(MeshError::BusStopped)));

        bus.start().await.unwrap();
        assert!(
            bus.publish(Message::new(MessageKind::Heartbeat, Payload::new()))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_messages_queued_before_start_are_delivered() {
        let bus = InMemoryBus::new();
        let inbox: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("late"), recorder(&inbox)).await.unwrap();
        bus.publish(Message::direct(MessageKind::Query, AgentId::from("late"), Payload::new()))
            .await
            .unwrap();
        assert_eq!(bus.metrics().await.queue_depth, 1);

        bus.start().await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(inbox.lock().unwrap().len(), 1);
    }
}
