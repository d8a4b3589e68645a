//! Query router
//!
//! Classifies each query, picks an expert for the category with the
//! configured load-balancing strategy, dispatches the query and later
//! forwards the expert's answer back to the original requester.

mod classifier;
mod registry;
mod strategy;

pub use classifier::{QueryCategory, QueryClassifier};
pub use registry::{ExpertRecord, ExpertRegistry, PendingRoute};
pub use strategy::{ExpertSelector, LoadBalancingStrategy};

use async_trait::async_trait;
use chrono::Utc;
use conclave_mesh::{AgentId, Message, MessageBus, MessageId, MessageKind, Payload, into_payload};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    agent::Agent,
    core::AgentCore,
    error::{AgentError, AgentResult},
    handler::HandlerTable,
    task::Task,
};

pub const ROUTER_CAPABILITIES: [&str; 4] = [
    "query_classification",
    "expert_routing",
    "load_balancing",
    "performance_tracking",
];

/// Requester recorded when a routing task names none
const UNKNOWN_REQUESTER: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingMetrics {
    pub total_routed: u64,
    pub routes_by_category: BTreeMap<String, u64>,
    pub routes_by_expert: BTreeMap<String, u64>,
    /// Running mean of classification + dispatch time, in seconds
    pub average_routing_time: f64,
    /// Queries for which no category expert was registered
    pub fallback_count: u64,
}

struct RouterState {
    experts: ExpertRegistry,
    selector: ExpertSelector,
    /// In dispatch order
    pending: Vec<PendingRoute>,
    metrics: RoutingMetrics,
}

/// Agent that load-balances queries across interchangeable experts
pub struct RouterAgent {
    core: AgentCore,
    handlers: HandlerTable<Self>,
    classifier: QueryClassifier,
    state: Mutex<RouterState>,
}

impl RouterAgent {
    pub const AGENT_TYPE: &'static str = "router";

    pub fn new(
        id: AgentId,
        bus: Option<Arc<dyn MessageBus>>,
        strategy: LoadBalancingStrategy,
    ) -> Self {
        info!(agent_id = %id, strategy = %strategy, "Router initialized");
        Self {
            core: AgentCore::new(id, Self::AGENT_TYPE, ROUTER_CAPABILITIES, bus),
            handlers: HandlerTable::with_defaults()
                .on(MessageKind::Query, handle_query)
                .on(MessageKind::Response, handle_response),
            classifier: QueryClassifier::new(),
            state: Mutex::new(RouterState {
                experts: ExpertRegistry::default(),
                selector: ExpertSelector::new(strategy),
                pending: Vec::new(),
                metrics: RoutingMetrics::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Override how long a heartbeat keeps this agent healthy
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_heartbeat_timeout(timeout);
        self
    }

    pub fn classify(&self, query: &str) -> QueryCategory {
        self.classifier.classify(query)
    }

    /// Add or replace an expert; a replaced expert keeps its selection order
    pub fn register_expert(&self, expert_id: AgentId, categories: Vec<String>, metadata: Payload) {
        info!(expert_id = %expert_id, categories = ?categories, "Registered expert");
        let record = ExpertRecord::new(expert_id, categories, metadata);
        self.lock().experts.register(record);
    }

    /// Classify `query`, pick an expert and dispatch to it
    ///
    /// With no eligible expert this returns `{routed: false, error}` rather
    /// than an error.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the dispatch could not be sent.
    pub async fn route_query(&self, query: &str, requester: AgentId) -> AgentResult<Value> {
        let started = Instant::now();
        let category = self.classifier.classify(query);
        debug!(category = %category, "Classified query");

        let dispatch = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let mut eligible = state.experts.eligible(category);
            if eligible.is_empty() {
                warn!(category = %category, "No experts available for category");
                state.metrics.fallback_count += 1;
                eligible = state.experts.registered_for(QueryCategory::General);
            }
            if eligible.is_empty() {
                return Ok(json!({
                    "routed": false,
                    "category": category,
                    "error": "No experts available",
                }));
            }

            let Some(expert_id) = state
                .selector
                .select(category.as_str(), &eligible)
                .map(|expert| expert.expert_id.clone())
            else {
                return Ok(json!({
                    "routed": false,
                    "category": category,
                    "error": "Expert selection failed",
                }));
            };

            let routed_at = Utc::now();
            let payload = json!({
                "query": query,
                "category": category,
                "requester_id": requester,
                "routed_at": routed_at,
            });
            let message =
                Message::direct(MessageKind::Query, expert_id.clone(), into_payload(payload));

            if let Some(expert) = state.experts.get_mut(&expert_id) {
                expert.load += 1;
                expert.total_queries += 1;
            }
            state.pending.push(PendingRoute {
                message_id: message.id,
                expert_id: expert_id.clone(),
                category,
                requester_id: requester.clone(),
                routed_at,
                query: query.to_string(),
            });
            message
        };

        let message_id = dispatch.id;
        let expert_id = dispatch.receiver.clone();
        if let Err(e) = self.core.send_message(dispatch).await {
            self.rollback(message_id);
            return Err(e);
        }

        let routing_time = started.elapsed().as_secs_f64();
        let expert_id = expert_id.map(String::from).unwrap_or_default();
        {
            let mut state = self.lock();
            let metrics = &mut state.metrics;
            metrics.total_routed += 1;
            *metrics
                .routes_by_category
                .entry(category.as_str().to_string())
                .or_insert(0) += 1;
            *metrics.routes_by_expert.entry(expert_id.clone()).or_insert(0) += 1;
            let n = metrics.total_routed as f64;
            metrics.average_routing_time += (routing_time - metrics.average_routing_time) / n;
        }

        info!(
            expert_id = %expert_id,
            category = %category,
            message_id = %message_id,
            "Routed query"
        );

        Ok(json!({
            "routed": true,
            "category": category,
            "expert_id": expert_id,
            "message_id": message_id.to_string(),
            "routing_time": routing_time,
        }))
    }

    /// Undo the bookkeeping of a dispatch that never left
    fn rollback(&self, message_id: MessageId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(pos) = state.pending.iter().position(|r| r.message_id == message_id) {
            let route = state.pending.remove(pos);
            if let Some(expert) = state.experts.get_mut(&route.expert_id) {
                expert.load = expert.load.saturating_sub(1);
                expert.total_queries = expert.total_queries.saturating_sub(1);
            }
        }
    }

    pub fn get_routing_stats(&self) -> Value {
        let state = self.lock();
        let expert_status: serde_json::Map<String, Value> = state
            .experts
            .iter()
            .map(|e| {
                (
                    e.expert_id.to_string(),
                    json!({
                        "categories": e.categories,
                        "load": e.load,
                        "total_queries": e.total_queries,
                        "avg_response_time": e.avg_response_time,
                    }),
                )
            })
            .collect();

        json!({
            "routing_metrics": state.metrics,
            "expert_status": expert_status,
            "total_experts": state.experts.len(),
            "load_balancing_strategy": state.selector.strategy().to_string(),
        })
    }

    pub fn expert(&self, expert_id: &AgentId) -> Option<ExpertRecord> {
        self.lock().experts.get(expert_id).cloned()
    }

    /// Experts in registration order
    pub fn experts(&self) -> Vec<ExpertRecord> {
        self.lock().experts.iter().cloned().collect()
    }

    /// In-flight routes in dispatch order
    pub fn pending_routes(&self) -> Vec<PendingRoute> {
        self.lock().pending.clone()
    }

    pub fn routing_metrics(&self) -> RoutingMetrics {
        self.lock().metrics.clone()
    }

    async fn on_query(&self, message: Message) -> AgentResult<()> {
        let requester = message
            .sender
            .as_ref()
            .map(AgentId::to_string)
            .unwrap_or_else(|| UNKNOWN_REQUESTER.to_string());
        info!(requester = %requester, "Received query for routing");

        let mut task = Task::new("route_query").with("requester_id", requester);
        if let Some(query) = message.payload.get("query") {
            task = task.with("query", query.clone());
        }
        let outcome = self.process_task(task).await;

        if message.sender.is_some() {
            self.core
                .send_message(Message::reply_to(
                    &message,
                    MessageKind::Response,
                    outcome.to_payload(),
                ))
                .await?;
        }
        Ok(())
    }

    async fn on_response(&self, message: Message) -> AgentResult<()> {
        let Some(sender) = message.sender.clone() else {
            warn!(message_id = %message.id, "Response without sender, dropping");
            return Ok(());
        };

        let (route, response_time) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            // oldest route for this expert
            let Some(pos) = state.pending.iter().position(|r| r.expert_id == sender) else {
                warn!(expert_id = %sender, "No pending route for expert response");
                return Ok(());
            };
            let route = state.pending.remove(pos);
            let response_time = (Utc::now() - route.routed_at)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            if let Some(expert) = state.experts.get_mut(&sender) {
                expert.load = expert.load.saturating_sub(1);
                expert.record_response(response_time);
            }
            (route, response_time)
        };

        let mut payload = message.payload;
        payload.insert("routed_by".to_string(), json!(self.core.id()));
        payload.insert("expert_id".to_string(), json!(route.expert_id));
        payload.insert("category".to_string(), json!(route.category));
        payload.insert(
            "routing_metadata".to_string(),
            json!({
                "response_time": response_time,
                "routed_at": route.routed_at,
            }),
        );

        let forward = Message::direct(MessageKind::Response, route.requester_id.clone(), payload)
            .with_correlation_id(route.message_id);
        debug!(
            expert_id = %route.expert_id,
            requester_id = %route.requester_id,
            "Forwarding expert response"
        );
        self.core.send_message(forward).await?;
        Ok(())
    }
}

#[async_trait]
impl Agent for RouterAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn handlers(&self) -> &HandlerTable<Self> {
        &self.handlers
    }

    async fn execute(&self, task: Task) -> AgentResult<Value> {
        match task.kind_or("route_query") {
            "route_query" => {
                let query = task.require_str("query")?;
                let requester = task.get_str("requester_id").unwrap_or(UNKNOWN_REQUESTER);
                let requester = AgentId::parse(requester)
                    .map_err(|e| AgentError::Validation(format!("invalid requester_id: {e}")))?;
                self.route_query(query, requester).await
            }
            "register_expert" => {
                let expert_id = AgentId::parse(task.require_str("expert_id")?)
                    .map_err(|e| AgentError::Validation(format!("invalid expert_id: {e}")))?;
                let categories = task.get_str_list("categories");
                let metadata = task
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.register_expert(expert_id.clone(), categories.clone(), metadata);
                Ok(json!({
                    "registered": true,
                    "expert_id": expert_id,
                    "categories": categories,
                }))
            }
            "get_routing_stats" => Ok(self.get_routing_stats()),
            other => Err(AgentError::UnknownOperation(format!("task type '{other}'"))),
        }
    }

    fn status_extras(&self) -> Payload {
        let state = self.lock();
        into_payload(json!({
            "routing_metrics": state.metrics,
            "registered_experts": state.experts.len(),
            "pending_routes": state.pending.len(),
            "load_balancing_strategy": state.selector.strategy().to_string(),
        }))
    }
}

fn handle_query(agent: &RouterAgent, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_query(message))
}

fn handle_response(agent: &RouterAgent, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_response(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::start;
    use crate::status::AgentStatus;
    use conclave_mesh::{InMemoryBus, MessageHandler, handler_fn};
    use std::time::Duration;

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

    async fn router(strategy: LoadBalancingStrategy) -> (Arc<InMemoryBus>, Arc<RouterAgent>) {
        let bus = Arc::new(InMemoryBus::new());
        bus.start().await.unwrap();
        let dyn_bus: Arc<dyn MessageBus> = bus.clone();
        let router = Arc::new(RouterAgent::new(AgentId::from("router"), Some(dyn_bus), strategy));
        start(&router).await.unwrap();
        (bus, router)
    }

    async fn settle(bus: &InMemoryBus) {
        assert!(bus.wait_idle(Duration::from_secs(2)).await);
    }

    fn categories(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_general_expert_takes_any_category() {
        let (bus, router) = router(LoadBalancingStrategy::RoundRobin).await;
        let expert: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("X"), recorder(&expert)).await.unwrap();
        router.register_expert(AgentId::from("X"), categories(&["general"]), Payload::new());

        let result = router
            .route_query("write a python function", AgentId::from("client"))
            .await
            .unwrap();
        assert_eq!(result["routed"], json!(true));
        assert_eq!(result["expert_id"], json!("X"));
        assert_eq!(result["category"], json!("technical"));
        settle(&bus).await;

        let dispatched = expert.lock().unwrap()[0].clone();
        assert_eq!(
            dispatched.payload["query"],
            json!("write a python function")
        );
        assert_eq!(dispatched.payload["requester_id"], json!("client"));
        assert_eq!(router.routing_metrics().fallback_count, 0);
        assert_eq!(router.expert(&AgentId::from("X")).unwrap().load, 1);
    }

    #[tokio::test]
    async fn test_no_experts_is_a_result_not_an_error() {
        let (_bus, router) = router(LoadBalancingStrategy::RoundRobin).await;
        router.register_expert(AgentId::from("L"), categories(&["legal"]), Payload::new());

        let result = router
            .route_query("how do I treat this symptom", AgentId::from("client"))
            .await
            .unwrap();
        assert_eq!(
            result,
            json!({"routed": false, "category": "medical", "error": "No experts available"})
        );
        let metrics = router.routing_metrics();
        assert_eq!(metrics.fallback_count, 1);
        assert_eq!(metrics.total_routed, 0);
    }

    #[tokio::test]
    async fn test_expert_response_is_forwarded_to_requester() {
        let (bus, router) = router(LoadBalancingStrategy::LeastLoaded).await;
        let expert: Inbox = Arc::default();
        let client: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("A"), recorder(&expert)).await.unwrap();
        bus.subscribe(&AgentId::from("client"), recorder(&client)).await.unwrap();
        router.register_expert(AgentId::from("A"), categories(&["legal"]), Payload::new());

        let routed = router
            .route_query("is this contract valid", AgentId::from("client"))
            .await
            .unwrap();
        settle(&bus).await;
        let dispatch = expert.lock().unwrap()[0].clone();
        assert_eq!(routed["message_id"], json!(dispatch.id.to_string()));

        let answer = Message::reply_to(
            &dispatch,
            MessageKind::Response,
            into_payload(json!({"answer": "it depends"})),
        )
        .with_sender(AgentId::from("A"));
        bus.publish(answer).await.unwrap();
        settle(&bus).await;

        let forwarded = client.lock().unwrap()[0].clone();
        assert_eq!(forwarded.kind, MessageKind::Response);
        assert_eq!(forwarded.sender, Some(AgentId::from("router")));
        assert_eq!(forwarded.correlation_id, Some(dispatch.id));
        assert_eq!(forwarded.payload["answer"], json!("it depends"));
        assert_eq!(forwarded.payload["routed_by"], json!("router"));
        assert_eq!(forwarded.payload["expert_id"], json!("A"));
        assert_eq!(forwarded.payload["category"], json!("legal"));
        assert!(forwarded.payload["routing_metadata"]["response_time"].is_f64());

        let record = router.expert(&AgentId::from("A")).unwrap();
        assert_eq!(record.load, 0);
        assert_eq!(record.total_queries, 1);
        assert_eq!(record.responses, 1);
        assert!(router.pending_routes().is_empty());
    }

    #[tokio::test]
    async fn test_response_reconciles_oldest_route_of_sender() {
        let (bus, router) = router(LoadBalancingStrategy::RoundRobin).await;
        let expert: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("A"), recorder(&expert)).await.unwrap();
        router.register_expert(AgentId::from("A"), categories(&["general"]), Payload::new());

        router.route_query("first", AgentId::from("c1")).await.unwrap();
        router.route_query("second", AgentId::from("c2")).await.unwrap();
        settle(&bus).await;
        let later = expert.lock().unwrap()[1].clone();

        // answer correlated to the newer dispatch still closes the older route
        let answer = Message::reply_to(&later, MessageKind::Response, Payload::new())
            .with_sender(AgentId::from("A"));
        bus.publish(answer).await.unwrap();
        settle(&bus).await;

        let pending = router.pending_routes();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].query, "second");
        assert_eq!(router.expert(&AgentId::from("A")).unwrap().load, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_ignored() {
        let (bus, router) = router(LoadBalancingStrategy::RoundRobin).await;
        let stray = Message::direct(
            MessageKind::Response,
            AgentId::from("router"),
            Payload::new(),
        )
        .with_sender(AgentId::from("nobody"));
        bus.publish(stray).await.unwrap();
        settle(&bus).await;

        assert_eq!(router.core().status(), AgentStatus::Ready);
        assert_eq!(router.core().metrics().messages_received, 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_rolls_back() {
        let (bus, router) = router(LoadBalancingStrategy::RoundRobin).await;
        router.register_expert(AgentId::from("A"), categories(&["general"]), Payload::new());
        bus.stop().await.unwrap();

        let result = router.route_query("anything", AgentId::from("client")).await;
        assert!(matches!(result, Err(AgentError::Mesh(_))));
        assert!(router.pending_routes().is_empty());
        let record = router.expert(&AgentId::from("A")).unwrap();
        assert_eq!(record.load, 0);
        assert_eq!(record.total_queries, 0);
    }

    #[tokio::test]
    async fn test_query_message_gets_routing_confirmation() {
        let (bus, router) = router(LoadBalancingStrategy::RoundRobin).await;
        let client: Inbox = Arc::default();
        let expert: Inbox = Arc::default();
        bus.subscribe(&AgentId::from("client"), recorder(&client)).await.unwrap();
        bus.subscribe(&AgentId::from("M"), recorder(&expert)).await.unwrap();
        router.register_expert(AgentId::from("M"), categories(&["medical"]), Payload::new());

        let query = Message::direct(
            MessageKind::Query,
            AgentId::from("router"),
            into_payload(json!({"query": "which doctor treats this disease"})),
        )
        .with_sender(AgentId::from("client"));
        let query_id = query.id;
        bus.publish(query).await.unwrap();
        settle(&bus).await;

        let confirmation = client.lock().unwrap()[0].clone();
        assert_eq!(confirmation.correlation_id, Some(query_id));
        assert_eq!(confirmation.payload["success"], json!(true));
        assert_eq!(confirmation.payload["result"]["expert_id"], json!("M"));
        assert_eq!(
            expert.lock().unwrap()[0].payload["requester_id"],
            json!("client")
        );
    }

    #[tokio::test]
    async fn test_process_task_variants() {
        let (_bus, router) = router(LoadBalancingStrategy::PerformanceBased).await;

        let registered = router
            .process_task(
                Task::new("register_expert")
                    .with("expert_id", "A")
                    .with("categories", json!(["code"]))
                    .with("metadata", json!({"model": "small"})),
            )
            .await;
        assert!(registered.success);
        router
            .process_task(
                Task::new("register_expert")
                    .with("expert_id", "A")
                    .with("categories", json!(["code", "technical"])),
            )
            .await;
        let experts = router.experts();
        assert_eq!(experts.len(), 1);
        assert_eq!(experts[0].categories, categories(&["code", "technical"]));

        let stats = router.process_task(Task::new("get_routing_stats")).await;
        let stats = stats.result.unwrap();
        assert_eq!(stats["total_experts"], json!(1));
        assert_eq!(stats["load_balancing_strategy"], json!("performance_based"));

        let missing = router.process_task(Task::new("route_query")).await;
        assert!(!missing.success);

        let unknown = router.process_task(Task::new("teleport")).await;
        assert_eq!(
            unknown.error.as_deref(),
            Some("Unknown operation: task type 'teleport'")
        );

        let extras = router.status_extras();
        assert_eq!(extras["registered_experts"], json!(1));
        assert_eq!(extras["pending_routes"], json!(0));
    }
}
