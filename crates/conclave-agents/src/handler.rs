//! Message-kind dispatch table
//!
//! Each role builds a [`HandlerTable`] once, at construction, mapping a
//! [`MessageKind`] to a plain function. The two defaults every agent shares
//! (heartbeat replies and status requests) are installed by
//! [`HandlerTable::with_defaults`]; roles override or add entries with
//! [`HandlerTable::on`].

use conclave_mesh::{Message, MessageKind, into_payload};
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{agent::Agent, error::AgentResult};

/// Handler for one message kind
pub type Handler<A> = for<'a> fn(&'a A, Message) -> BoxFuture<'a, AgentResult<()>>;

/// Fixed mapping from message kind to handler
pub struct HandlerTable<A> {
    entries: HashMap<MessageKind, Handler<A>>,
}

impl<A: Agent> HandlerTable<A> {
    /// Empty table; every message kind is dropped
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Table with the heartbeat and status-request handlers installed
    pub fn with_defaults() -> Self {
        Self::new()
            .on(MessageKind::Heartbeat, handle_heartbeat::<A>)
            .on(MessageKind::Request, handle_request::<A>)
    }

    /// Install or replace the handler for `kind`
    #[must_use]
    pub fn on(mut self, kind: MessageKind, handler: Handler<A>) -> Self {
        self.entries.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<Handler<A>> {
        self.entries.get(&kind).copied()
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.entries.contains_key(&kind)
    }
}

impl<A: Agent> Default for HandlerTable<A> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Refresh the heartbeat and answer with status and counters
pub fn handle_heartbeat<A: Agent>(agent: &A, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(async move {
        let core = agent.core();
        core.touch_heartbeat();

        if message.sender.is_none() {
            return Ok(());
        }
        let payload = into_payload(json!({
            "status": core.status(),
            "metrics": core.metrics(),
        }));
        core.send_message(Message::reply_to(&message, MessageKind::Heartbeat, payload))
            .await?;
        Ok(())
    })
}

/// Answer `get_status` and `get_capabilities` requests
///
/// Role-specific request types are handled by the default arm of a role's
/// own `Request` handler, which can delegate here.
pub fn handle_request<A: Agent>(agent: &A, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(async move {
        let core = agent.core();
        if message.sender.is_none() {
            return Ok(());
        }
        let reply = match message.payload_str("request_type") {
            Some("get_status") => serde_json::to_value(agent.status())?,
            Some("get_capabilities") => json!({ "capabilities": core.capabilities() }),
            other => {
                warn!(
                    agent_id = %core.id(),
                    request_type = other.unwrap_or(""),
                    "Ignoring unknown request type"
                );
                return Ok(());
            }
        };

        debug!(agent_id = %core.id(), message_id = %message.id, "Answering request");
        core.send_message(Message::reply_to(
            &message,
            MessageKind::Response,
            into_payload(reply),
        ))
        .await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::start, core::AgentCore, error::AgentError, status::AgentStatus, task::Task,
    };
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use conclave_mesh::{AgentId, InMemoryBus, MessageBus, Payload, handler_fn};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Plain {
        core: AgentCore,
        handlers: HandlerTable<Plain>,
    }

    #[async_trait]
    impl Agent for Plain {
        fn core(&self) -> &AgentCore {
            &self.core
        }

        fn handlers(&self) -> &HandlerTable<Self> {
            &self.handlers
        }

        async fn execute(&self, _task: Task) -> AgentResult<Value> {
            Err(AgentError::UnknownOperation("no tasks".to_string()))
        }

        fn status_extras(&self) -> Payload {
            into_payload(json!({ "role": "plain" }))
        }
    }

    struct Harness {
        bus: Arc<InMemoryBus>,
        agent: Arc<Plain>,
        client: Arc<Mutex<Vec<Message>>>,
    }

    impl Harness {
        async fn new() -> Self {
            let bus = Arc::new(InMemoryBus::new());
            bus.start().await.unwrap();
            let dyn_bus: Arc<dyn MessageBus> = bus.clone();

            let client = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&client);
            bus.subscribe(
                &AgentId::from("client"),
                Arc::new(handler_fn(move |msg: Message| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(msg);
                        Ok(())
                    }
                })),
            )
            .await
            .unwrap();

            let agent = Arc::new(Plain {
                core: AgentCore::new(
                    AgentId::from("plain"),
                    "plain",
                    ["listening", "answering"],
                    Some(dyn_bus),
                ),
                handlers: HandlerTable::with_defaults(),
            });
            start(&agent).await.unwrap();
            Self { bus, agent, client }
        }

        /// Deliver `payload` as `kind` from the client and return the sent id
        async fn send(&self, kind: MessageKind, payload: Value) -> conclave_mesh::MessageId {
            let msg = Message::direct(kind, AgentId::from("plain"), into_payload(payload))
                .with_sender(AgentId::from("client"));
            let id = msg.id;
            self.bus.publish(msg).await.unwrap();
            assert!(self.bus.wait_idle(Duration::from_secs(2)).await);
            id
        }

        fn replies(&self) -> Vec<Message> {
            self.client.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_defaults_cover_heartbeat_and_request() {
        let table: HandlerTable<Plain> = HandlerTable::with_defaults();
        assert!(table.handles(MessageKind::Heartbeat));
        assert!(table.handles(MessageKind::Request));
        assert!(!table.handles(MessageKind::Query));
        assert!(!HandlerTable::<Plain>::new().handles(MessageKind::Heartbeat));
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_and_replies() {
        let h = Harness::new().await;
        let stale = Utc::now() - TimeDelta::seconds(120);
        h.agent.core().set_last_heartbeat(stale);
        assert!(!h.agent.core().is_healthy());

        let heartbeat_id = h.send(MessageKind::Heartbeat, json!({})).await;

        let replies = h.replies();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply.kind, MessageKind::Heartbeat);
        assert_eq!(reply.correlation_id, Some(heartbeat_id));
        assert_eq!(reply.sender, Some(AgentId::from("plain")));
        assert_eq!(reply.payload["status"], json!("ready"));
        assert_eq!(reply.payload["metrics"]["messages_received"], json!(1));

        assert!(h.agent.core().last_heartbeat() > stale);
        assert!(h.agent.core().is_healthy());
        assert_eq!(h.agent.core().metrics().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_get_status_request() {
        let h = Harness::new().await;

        let request_id = h
            .send(MessageKind::Request, json!({"request_type": "get_status"}))
            .await;

        let reply = h.replies()[0].clone();
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.correlation_id, Some(request_id));
        assert_eq!(reply.payload["agent_id"], json!("plain"));
        assert_eq!(reply.payload["agent_type"], json!("plain"));
        assert_eq!(reply.payload["status"], json!("ready"));
        assert_eq!(
            reply.payload["capabilities"],
            json!(["listening", "answering"])
        );
        assert_eq!(reply.payload["role"], json!("plain"));
        assert_eq!(reply.payload["metrics"]["messages_received"], json!(1));
    }

    #[tokio::test]
    async fn test_get_capabilities_request() {
        let h = Harness::new().await;

        h.send(
            MessageKind::Request,
            json!({"request_type": "get_capabilities"}),
        )
        .await;

        let reply = h.replies()[0].clone();
        assert_eq!(
            Value::Object(reply.payload),
            json!({"capabilities": ["listening", "answering"]})
        );
    }

    #[tokio::test]
    async fn test_unknown_request_type_is_ignored() {
        let h = Harness::new().await;

        h.send(MessageKind::Request, json!({"request_type": "dance"}))
            .await;
        h.send(MessageKind::Request, json!({})).await;

        assert!(h.replies().is_empty());
        assert_eq!(h.agent.core().status(), AgentStatus::Ready);
        assert_eq!(h.agent.core().metrics().messages_received, 2);
    }

    #[tokio::test]
    async fn test_request_without_sender_gets_no_reply() {
        let h = Harness::new().await;

        let msg = Message::direct(
            MessageKind::Request,
            AgentId::from("plain"),
            into_payload(json!({"request_type": "get_status"})),
        );
        h.bus.publish(msg).await.unwrap();
        assert!(h.bus.wait_idle(Duration::from_secs(2)).await);

        assert!(h.replies().is_empty());
        assert_eq!(h.agent.core().metrics().messages_sent, 0);
        assert_eq!(h.agent.core().status(), AgentStatus::Ready);
    }
}
