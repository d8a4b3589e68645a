//! Retrieval worker
//!
//! Answers queries from a pluggable [`Retriever`], caching answers per query
//! text for a configurable time. It is the worker a coordinator sends
//! queries to and the kind of expert a router dispatches to.

mod keyword;

pub use keyword::KeywordRetriever;

use async_trait::async_trait;
use conclave_mesh::{AgentId, Message, MessageBus, MessageKind, Payload, into_payload};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::{
    agent::Agent,
    core::AgentCore,
    error::{AgentError, AgentResult},
    handler::HandlerTable,
    task::Task,
};

pub const RETRIEVAL_CAPABILITIES: [&str; 4] = [
    "document_retrieval",
    "question_answering",
    "knowledge_lookup",
    "context_provision",
];

/// Default lifetime of a cached answer
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default number of documents requested per query
pub const DEFAULT_TOP_K: u64 = 5;

/// `top_k` used by technical workers when a query names none
const TECHNICAL_TOP_K: u64 = 7;

/// A document to index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Payload,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            metadata: Payload::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Payload,
}

/// Generated answer plus the documents it was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub retrieved_documents: Vec<RetrievedDocument>,
}

/// Document store and answer generator behind a retrieval worker
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Retrieve and answer
    async fn query(&self, text: &str, top_k: usize) -> AgentResult<QueryAnswer>;

    /// Retrieve without generating an answer
    async fn retrieve(&self, text: &str, top_k: usize) -> AgentResult<Vec<RetrievedDocument>>;

    /// Index documents, returning how many were added
    async fn add_documents(&self, documents: Vec<Document>) -> AgentResult<usize>;
}

/// Domain a worker is tuned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specialization {
    General,
    Technical,
    Code,
}

impl Specialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Specialization::General => "general",
            Specialization::Technical => "technical",
            Specialization::Code => "code",
        }
    }

    pub fn agent_type(&self) -> &'static str {
        match self {
            Specialization::General => "general_rag_agent",
            Specialization::Technical => "technical_rag_agent",
            Specialization::Code => "code_rag_agent",
        }
    }

    /// Router categories this worker should be registered for
    pub fn categories(&self) -> &'static [&'static str] {
        match self {
            Specialization::General => &["general"],
            Specialization::Technical => &["technical", "engineering"],
            Specialization::Code => &["code", "programming"],
        }
    }

    fn capabilities(&self) -> &'static [&'static str] {
        match self {
            Specialization::General => &["general_knowledge", "broad_topics", "fallback_handling"],
            Specialization::Technical => &[
                "technical_documentation",
                "api_reference",
                "architecture_explanation",
                "engineering_concepts",
            ],
            Specialization::Code => &[
                "code_examples",
                "programming_tutorials",
                "debugging_assistance",
                "implementation_guidance",
                "code_explanation",
            ],
        }
    }

    /// Tag a successful result with the worker's specialization
    fn decorate(&self, result: &mut Value) {
        let Value::Object(fields) = result else {
            return;
        };
        fields.insert("specialization".to_string(), json!(self.as_str()));
        fields.insert("agent_type".to_string(), json!(self.agent_type()));
        match self {
            Specialization::General => {}
            Specialization::Technical => {
                fields.insert("technical_focus".to_string(), json!(true));
            }
            Specialization::Code => {
                fields.insert("code_focused".to_string(), json!(true));
                if let Some(answer) = fields.get("answer").and_then(Value::as_str) {
                    let contains_code = answer.contains("```")
                        || answer.contains("def ")
                        || answer.contains("function ");
                    fields.insert("contains_code".to_string(), json!(contains_code));
                }
            }
        }
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Specialization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "general" => Ok(Self::General),
            "technical" => Ok(Self::Technical),
            "code" => Ok(Self::Code),
            other => Err(format!("unknown specialization '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub cache_ttl: Duration,
    pub cache_enabled: bool,
    pub top_k: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_enabled: true,
            top_k: DEFAULT_TOP_K,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalMetrics {
    pub queries_processed: u64,
    pub documents_retrieved: u64,
    /// Running mean over retriever queries, in seconds
    pub average_query_time: f64,
    pub cache_hits: u64,
}

struct CachedAnswer {
    answer: Value,
    stored_at: Instant,
}

impl CachedAnswer {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

#[derive(Default)]
struct RetrievalState {
    cache: HashMap<String, CachedAnswer>,
    metrics: RetrievalMetrics,
}

/// Agent answering queries from a [`Retriever`]
pub struct RetrievalAgent {
    core: AgentCore,
    handlers: HandlerTable<Self>,
    retriever: Arc<dyn Retriever>,
    specialization: Option<Specialization>,
    settings: RetrievalSettings,
    state: Mutex<RetrievalState>,
}

impl RetrievalAgent {
    pub const AGENT_TYPE: &'static str = "rag_agent";

    pub fn new(
        id: AgentId,
        bus: Option<Arc<dyn MessageBus>>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        Self::build(id, bus, retriever, None, RetrievalSettings::default())
    }

    pub fn specialized(
        id: AgentId,
        bus: Option<Arc<dyn MessageBus>>,
        retriever: Arc<dyn Retriever>,
        specialization: Specialization,
    ) -> Self {
        Self::build(
            id,
            bus,
            retriever,
            Some(specialization),
            RetrievalSettings::default(),
        )
    }

    pub fn build(
        id: AgentId,
        bus: Option<Arc<dyn MessageBus>>,
        retriever: Arc<dyn Retriever>,
        specialization: Option<Specialization>,
        settings: RetrievalSettings,
    ) -> Self {
        let agent_type = specialization.map_or(Self::AGENT_TYPE, |s| s.agent_type());
        let capabilities = RETRIEVAL_CAPABILITIES
            .iter()
            .chain(specialization.map_or(&[][..], |s| s.capabilities()))
            .copied();
        info!(
            agent_id = %id,
            agent_type,
            cache_ttl_secs = settings.cache_ttl.as_secs(),
            "Retrieval agent initialized"
        );
        Self {
            core: AgentCore::new(id, agent_type, capabilities, bus),
            handlers: HandlerTable::with_defaults().on(MessageKind::Query, handle_query),
            retriever,
            specialization,
            settings,
            state: Mutex::new(RetrievalState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RetrievalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Override how long a heartbeat keeps this agent healthy
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_heartbeat_timeout(timeout);
        self
    }

    pub fn specialization(&self) -> Option<Specialization> {
        self.specialization
    }

    pub fn retrieval_metrics(&self) -> RetrievalMetrics {
        self.lock().metrics.clone()
    }

    pub fn cache_size(&self) -> usize {
        self.lock().cache.len()
    }

    pub fn clear_cache(&self) {
        self.lock().cache.clear();
        info!(agent_id = %self.core.id(), "Query cache cleared");
    }

    fn default_top_k(&self) -> u64 {
        match self.specialization {
            Some(Specialization::Technical) => TECHNICAL_TOP_K,
            _ => self.settings.top_k,
        }
    }

    fn top_k(&self, task: &Task) -> usize {
        let top_k = task.get_u64_or("top_k", self.default_top_k());
        usize::try_from(top_k).unwrap_or(usize::MAX)
    }

    async fn run_query(&self, task: &Task) -> AgentResult<Value> {
        let query = task.require_str("query")?;
        let top_k = self.top_k(task);
        let use_cache = task.get_bool_or("use_cache", self.settings.cache_enabled);

        if use_cache {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.cache.get(query) {
                Some(entry) if entry.is_fresh(self.settings.cache_ttl) => {
                    let answer = entry.answer.clone();
                    state.metrics.cache_hits += 1;
                    debug!(agent_id = %self.core.id(), "Cache hit");
                    return Ok(answer);
                }
                Some(_) => {
                    state.cache.remove(query);
                }
                None => {}
            }
        }

        let started = Instant::now();
        let answer = self.retriever.query(query, top_k).await?;
        let elapsed = started.elapsed().as_secs_f64();
        let retrieved = answer.retrieved_documents.len() as u64;
        let answer = serde_json::to_value(answer)?;

        let mut state = self.lock();
        let metrics = &mut state.metrics;
        metrics.queries_processed += 1;
        metrics.documents_retrieved += retrieved;
        let n = metrics.queries_processed as f64;
        metrics.average_query_time += (elapsed - metrics.average_query_time) / n;
        if use_cache {
            let ttl = self.settings.cache_ttl;
            state.cache.retain(|_, entry| entry.is_fresh(ttl));
            state.cache.insert(
                query.to_string(),
                CachedAnswer {
                    answer: answer.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
        debug!(agent_id = %self.core.id(), documents = retrieved, "Answered query");
        Ok(answer)
    }

    async fn run_retrieve(&self, task: &Task) -> AgentResult<Value> {
        let query = task.require_str("query")?;
        let documents = self.retriever.retrieve(query, self.top_k(task)).await?;
        self.lock().metrics.documents_retrieved += documents.len() as u64;
        Ok(json!({
            "query": query,
            "count": documents.len(),
            "documents": documents,
        }))
    }

    async fn run_index(&self, task: &Task) -> AgentResult<Value> {
        let documents = parse_documents(task)?;
        info!(agent_id = %self.core.id(), count = documents.len(), "Indexing documents");
        let indexed = self.retriever.add_documents(documents).await?;
        Ok(json!({
            "indexed_count": indexed,
            "message": format!("Successfully indexed {indexed} documents"),
        }))
    }

    async fn on_query(&self, message: Message) -> AgentResult<()> {
        debug!(
            agent_id = %self.core.id(),
            sender = message.sender.as_ref().map(AgentId::as_str).unwrap_or(""),
            "Received query"
        );
        let query = message.payload.get("query").cloned().unwrap_or(Value::Null);
        let mut task = Task::new("query").with("query", query.clone()).with(
            "use_cache",
            message.payload.get("use_cache").cloned().unwrap_or(json!(true)),
        );
        if let Some(top_k) = message.payload.get("top_k") {
            task = task.with("top_k", top_k.clone());
        }
        let outcome = self.process_task(task).await;

        if message.sender.is_none() {
            return Ok(());
        }
        let payload = into_payload(json!({
            "query": query,
            "result": outcome,
        }));
        self.core
            .send_message(Message::reply_to(&message, MessageKind::Response, payload))
            .await?;
        Ok(())
    }
}

/// Accepts plain strings or `{text, id?, metadata?}` objects
fn parse_documents(task: &Task) -> AgentResult<Vec<Document>> {
    let items = match task.get("documents").and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items,
        _ => return Err(AgentError::missing("documents")),
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(text) => Ok(Document::new(text.clone())),
            other => serde_json::from_value(other.clone())
                .map_err(|e| AgentError::Validation(format!("invalid document: {e}"))),
        })
        .collect()
}

#[async_trait]
impl Agent for RetrievalAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn handlers(&self) -> &HandlerTable<Self> {
        &self.handlers
    }

    async fn execute(&self, task: Task) -> AgentResult<Value> {
        let mut result = match task.kind_or("query") {
            "query" => self.run_query(&task).await?,
            "retrieve" => self.run_retrieve(&task).await?,
            "index" => self.run_index(&task).await?,
            other => return Err(AgentError::UnknownOperation(format!("task type '{other}'"))),
        };
        if let Some(specialization) = self.specialization {
            specialization.decorate(&mut result);
        }
        Ok(result)
    }

    async fn on_stop(&self) -> AgentResult<()> {
        self.clear_cache();
        Ok(())
    }

    fn status_extras(&self) -> Payload {
        let state = self.lock();
        into_payload(json!({
            "rag_metrics": state.metrics,
            "cache_size": state.cache.len(),
            "specialization": self.specialization,
        }))
    }
}

fn handle_query(agent: &RetrievalAgent, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_query(message))
}
