//! In-process demo systems on the configured bus

use conclave_agents::{
    Agent, AgentError, CoordinatorAgent, EvaluatorAgent, KeywordRetriever, LexicalScorer,
    QueryClassifier, RetrievalAgent, RouterAgent, Specialization, SystemConfig, WorkflowStatus,
    start, stop,
};
use conclave_mesh::{
    AgentId, ConfigError, IdValidationError, MeshError, Message, MessageBus, MessageKind,
    create_bus, handler_fn, into_payload,
};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

const CLIENT_ID: &str = "demo_client";

const CORPUS: [&str; 8] = [
    "Rust guarantees memory safety through ownership and borrowing without a garbage collector.",
    "Tokio is an asynchronous runtime for Rust that schedules tasks on a thread pool.",
    "A message bus decouples senders from receivers by delivering messages through channels.",
    "Redis pub/sub delivers each published message to every subscriber of the channel.",
    "To write a function in Python, use the def keyword followed by the function name.",
    "An API exposes operations of a software component to other programs.",
    "Load balancing spreads requests across several workers to avoid overloading one of them.",
    "Retrieval augmented generation answers questions from documents retrieved for the query.",
];

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("Invalid agent id: {0}")]
    InvalidId(#[from] IdValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout { seconds: u64, what: String },
}

async fn connect(config: &SystemConfig) -> Result<Arc<dyn MessageBus>, DemoError> {
    let bus = create_bus(&config.bus).await;
    bus.start().await?;
    Ok(bus)
}

async fn wait_for<T>(
    seconds: u64,
    what: &str,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T, DemoError> {
    let deadline = Instant::now() + Duration::from_secs(seconds);
    loop {
        if let Some(found) = check() {
            return Ok(found);
        }
        if Instant::now() >= deadline {
            return Err(DemoError::Timeout {
                seconds,
                what: what.to_string(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Coordinator, worker and (optionally) evaluator answering one query
pub async fn run_coordinate(query: &str, evaluate: bool, timeout: u64) -> Result<(), DemoError> {
    let config = SystemConfig::from_env()?;
    let bus = connect(&config).await?;

    let worker = Arc::new(
        RetrievalAgent::build(
            config.default_worker.clone(),
            Some(bus.clone()),
            Arc::new(KeywordRetriever::with_texts(CORPUS)),
            None,
            config.retrieval_settings(),
        )
        .with_heartbeat_timeout(config.heartbeat_timeout),
    );
    start(&worker).await?;

    let evaluator = match config.default_evaluator.clone().filter(|_| evaluate) {
        Some(id) => {
            let evaluator = Arc::new(
                EvaluatorAgent::with_scorer(
                    id,
                    Some(bus.clone()),
                    Arc::new(LexicalScorer),
                    config.quality_threshold,
                )
                .with_heartbeat_timeout(config.heartbeat_timeout),
            );
            start(&evaluator).await?;
            Some(evaluator)
        }
        None => None,
    };

    let coordinator = Arc::new(
        CoordinatorAgent::with_settings(
            AgentId::parse("coordinator_001")?,
            Some(bus.clone()),
            config.coordinator_settings(),
        )
        .with_heartbeat_timeout(config.heartbeat_timeout),
    );
    start(&coordinator).await?;

    let evaluator_id = evaluator.as_ref().map(|e| e.core().id().clone());
    let started = coordinator
        .coordinate_query(query, worker.core().id().clone(), evaluator_id)
        .await?;
    let workflow_id = started["workflow_id"].as_str().unwrap_or_default().to_string();
    info!(workflow_id = %workflow_id, "Workflow started");

    let workflow = wait_for(timeout, "workflow completion", || {
        coordinator.workflow(&workflow_id).filter(|w| {
            matches!(w.status, WorkflowStatus::Completed | WorkflowStatus::Failed)
        })
    })
    .await?;
    println!("{}", serde_json::to_string_pretty(&workflow)?);
    println!("{}", serde_json::to_string_pretty(&coordinator.status())?);

    stop(&coordinator).await?;
    if let Some(evaluator) = &evaluator {
        stop(evaluator).await?;
    }
    stop(&worker).await?;
    bus.stop().await?;
    Ok(())
}

/// Router in front of one worker per specialization
pub async fn run_route(
    queries: &[String],
    strategy: Option<&str>,
    timeout: u64,
) -> Result<(), DemoError> {
    let config = SystemConfig::from_env()?;
    let bus = connect(&config).await?;
    let strategy = match strategy {
        Some(name) => name.parse().unwrap_or_default(),
        None => config.router_strategy.clone(),
    };

    let router = Arc::new(
        RouterAgent::new(AgentId::parse("router_001")?, Some(bus.clone()), strategy)
            .with_heartbeat_timeout(config.heartbeat_timeout),
    );
    start(&router).await?;

    let mut experts = Vec::new();
    for specialization in [
        Specialization::General,
        Specialization::Technical,
        Specialization::Code,
    ] {
        let id = AgentId::parse(format!("{specialization}_rag_agent_001"))?;
        let expert = Arc::new(RetrievalAgent::build(
            id.clone(),
            Some(bus.clone()),
            Arc::new(KeywordRetriever::with_texts(CORPUS)),
            Some(specialization),
            config.retrieval_settings(),
        ));
        start(&expert).await?;
        let categories = specialization
            .categories()
            .iter()
            .map(|c| c.to_string())
            .collect();
        router.register_expert(id, categories, into_payload(json!({"demo": true})));
        experts.push(expert);
    }

    let inbox: Arc<Mutex<Vec<Message>>> = Arc::default();
    let sink = Arc::clone(&inbox);
    let client = AgentId::parse(CLIENT_ID)?;
    bus.subscribe(
        &client,
        Arc::new(handler_fn(move |message: Message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message);
                Ok(())
            }
        })),
    )
    .await?;

    for query in queries {
        let message = Message::direct(
            MessageKind::Query,
            router.core().id().clone(),
            into_payload(json!({ "query": query })),
        )
        .with_sender(client.clone());
        bus.publish(message).await?;
    }

    // one confirmation and one forwarded answer per query
    let expected = queries.len() * 2;
    let replies = wait_for(timeout, "expert answers", || {
        let received = inbox.lock().unwrap_or_else(PoisonError::into_inner);
        (received.len() >= expected && router.pending_routes().is_empty())
            .then(|| received.clone())
    })
    .await?;

    for reply in replies.iter().filter(|m| m.payload.contains_key("routed_by")) {
        let answer = reply
            .payload
            .get("result")
            .and_then(|r| r.get("result"))
            .and_then(|r| r.get("answer"));
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "query": reply.payload.get("query"),
                "expert_id": reply.payload.get("expert_id"),
                "category": reply.payload.get("category"),
                "answer": answer,
            }))?
        );
    }
    println!("{}", serde_json::to_string_pretty(&router.get_routing_stats())?);

    bus.unsubscribe(&client).await?;
    for expert in &experts {
        stop(expert).await?;
    }
    stop(&router).await?;
    bus.stop().await?;
    Ok(())
}

/// Print the category and per-category scores of `query`
pub fn run_classify(query: &str) {
    let classifier = QueryClassifier::new();
    let scores: serde_json::Map<String, serde_json::Value> = classifier
        .scores(query)
        .into_iter()
        .map(|(category, score)| (category.to_string(), json!(score)))
        .collect();
    println!(
        "{}",
        json!({
            "category": classifier.classify(query),
            "scores": scores,
        })
    );
}
