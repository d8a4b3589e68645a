//! Answer evaluator
//!
//! Scores worker answers with a [`Scorer`] and keeps running quality
//! statistics. A worker response arriving on the bus is evaluated
//! automatically and answered with a notification carrying the scores.

mod scoring;

pub use scoring::{LexicalScorer, Scorer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_mesh::{AgentId, Message, MessageBus, MessageKind, Payload, into_payload};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    agent::Agent,
    core::AgentCore,
    error::{AgentError, AgentResult},
    handler::{HandlerTable, handle_request},
    task::Task,
};

pub const EVALUATOR_CAPABILITIES: [&str; 4] = [
    "response_evaluation",
    "quality_scoring",
    "feedback_generation",
    "performance_tracking",
];

pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;

/// Number of evaluations kept in history
pub const EVALUATION_HISTORY_CAPACITY: usize = 100;

/// Evaluations returned by `stats` as `recent_evaluations`
const RECENT_EVALUATIONS: usize = 10;

/// Queries are truncated to this many characters in history
const HISTORY_QUERY_CHARS: usize = 100;

const RELEVANCE_WEIGHT: f64 = 0.4;
const FAITHFULNESS_WEIGHT: f64 = 0.3;
const COMPLETENESS_WEIGHT: f64 = 0.3;

/// Below this a score gets its own line of feedback
const WEAK_SCORE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationScores {
    pub relevance: f64,
    pub faithfulness: f64,
    pub completeness: f64,
    pub quality: f64,
}

impl EvaluationScores {
    pub fn weighted(relevance: f64, faithfulness: f64, completeness: f64) -> Self {
        Self {
            relevance,
            faithfulness,
            completeness,
            quality: relevance * RELEVANCE_WEIGHT
                + faithfulness * FAITHFULNESS_WEIGHT
                + completeness * COMPLETENESS_WEIGHT,
        }
    }

    /// Human-readable verdict
    pub fn feedback(&self) -> String {
        let overall = match self.quality {
            q if q >= 0.9 => "Excellent response quality.",
            q if q >= 0.7 => "Good response quality.",
            q if q >= 0.5 => "Acceptable response quality, but improvements needed.",
            _ => "Poor response quality. Significant improvements required.",
        };
        let mut parts = vec![overall];
        if self.relevance < WEAK_SCORE {
            parts.push("Response relevance is low - answer may not address the query properly.");
        }
        if self.faithfulness < WEAK_SCORE {
            parts.push(
                "Faithfulness is low - answer may contain information not supported by context.",
            );
        }
        if self.completeness < WEAK_SCORE {
            parts.push("Completeness is low - answer may be missing important information.");
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub scores: EvaluationScores,
    pub passed: bool,
    pub feedback: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRecord {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub relevance: f64,
    pub faithfulness: f64,
    pub completeness: f64,
    pub quality_score: f64,
    pub passed: bool,
    pub feedback: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationMetrics {
    pub evaluations_performed: u64,
    pub average_relevance: f64,
    pub average_faithfulness: f64,
    pub average_completeness: f64,
    pub passed_evaluations: u64,
    pub failed_evaluations: u64,
}

impl EvaluationMetrics {
    fn record(&mut self, scores: &EvaluationScores, passed: bool) {
        self.evaluations_performed += 1;
        let n = self.evaluations_performed as f64;
        self.average_relevance += (scores.relevance - self.average_relevance) / n;
        self.average_faithfulness += (scores.faithfulness - self.average_faithfulness) / n;
        self.average_completeness += (scores.completeness - self.average_completeness) / n;
        if passed {
            self.passed_evaluations += 1;
        } else {
            self.failed_evaluations += 1;
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.evaluations_performed == 0 {
            0.0
        } else {
            self.passed_evaluations as f64 / self.evaluations_performed as f64
        }
    }
}

#[derive(Default)]
struct EvaluatorState {
    metrics: EvaluationMetrics,
    history: VecDeque<EvaluationRecord>,
}

/// Agent scoring worker answers
pub struct EvaluatorAgent {
    core: AgentCore,
    handlers: HandlerTable<Self>,
    scorer: Arc<dyn Scorer>,
    threshold: f64,
    state: Mutex<EvaluatorState>,
}

impl EvaluatorAgent {
    pub const AGENT_TYPE: &'static str = "evaluator_agent";

    pub fn new(id: AgentId, bus: Option<Arc<dyn MessageBus>>) -> Self {
        Self::with_scorer(id, bus, Arc::new(LexicalScorer), DEFAULT_QUALITY_THRESHOLD)
    }

    pub fn with_scorer(
        id: AgentId,
        bus: Option<Arc<dyn MessageBus>>,
        scorer: Arc<dyn Scorer>,
        threshold: f64,
    ) -> Self {
        info!(agent_id = %id, threshold, "Evaluator initialized");
        Self {
            core: AgentCore::new(id, Self::AGENT_TYPE, EVALUATOR_CAPABILITIES, bus),
            handlers: HandlerTable::with_defaults()
                .on(MessageKind::Response, handle_response)
                .on(MessageKind::Request, handle_evaluator_request),
            scorer,
            threshold,
            state: Mutex::new(EvaluatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EvaluatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Override how long a heartbeat keeps this agent healthy
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_heartbeat_timeout(timeout);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score an answer and record the result
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Validation` if `answer` is empty.
    pub fn evaluate(
        &self,
        query: &str,
        answer: &str,
        context: &str,
        ground_truth: Option<&str>,
    ) -> AgentResult<Evaluation> {
        if answer.is_empty() {
            return Err(AgentError::missing("answer"));
        }

        let scores = EvaluationScores::weighted(
            self.scorer.relevance(answer, query, context),
            self.scorer.faithfulness(answer, context),
            self.scorer.completeness(answer, ground_truth),
        );
        let passed = scores.quality >= self.threshold;
        let feedback = scores.feedback();

        {
            let mut state = self.lock();
            state.metrics.record(&scores, passed);
            state.history.push_back(EvaluationRecord {
                timestamp: Utc::now(),
                query: query.chars().take(HISTORY_QUERY_CHARS).collect(),
                relevance: scores.relevance,
                faithfulness: scores.faithfulness,
                completeness: scores.completeness,
                quality_score: scores.quality,
                passed,
                feedback: feedback.clone(),
            });
            while state.history.len() > EVALUATION_HISTORY_CAPACITY {
                state.history.pop_front();
            }
        }

        info!(
            agent_id = %self.core.id(),
            quality = scores.quality,
            passed,
            "Evaluation complete"
        );
        Ok(Evaluation {
            scores,
            passed,
            feedback,
            threshold: self.threshold,
        })
    }

    pub fn evaluation_metrics(&self) -> EvaluationMetrics {
        self.lock().metrics.clone()
    }

    /// Oldest first
    pub fn history(&self) -> Vec<EvaluationRecord> {
        self.lock().history.iter().cloned().collect()
    }

    /// Metrics plus pass rate and the most recent evaluations
    pub fn stats(&self) -> AgentResult<Value> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(RECENT_EVALUATIONS);
        let recent: Vec<&EvaluationRecord> = state.history.iter().skip(skip).collect();

        let mut stats = serde_json::to_value(&state.metrics)?;
        if let Value::Object(fields) = &mut stats {
            fields.insert("pass_rate".to_string(), json!(state.metrics.pass_rate()));
            fields.insert(
                "recent_evaluations".to_string(),
                serde_json::to_value(recent)?,
            );
        }
        Ok(stats)
    }

    async fn on_response(&self, message: Message) -> AgentResult<()> {
        let outcome = message.payload.get("result");
        if outcome.and_then(|o| o.get("success")).and_then(Value::as_bool) != Some(true) {
            warn!(
                agent_id = %self.core.id(),
                message_id = %message.id,
                "Received failed result, skipping evaluation"
            );
            return Ok(());
        }

        let result = outcome.and_then(|o| o.get("result"));
        let query = message.payload_str("query").unwrap_or_default().to_string();
        let answer = result
            .and_then(|r| r.get("answer"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let context = result
            .and_then(|r| r.get("retrieved_documents"))
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .map(|doc| doc.get("text").and_then(Value::as_str).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        debug!(agent_id = %self.core.id(), message_id = %message.id, "Evaluating response");
        let task = Task::new("evaluate")
            .with("query", query.clone())
            .with("answer", answer)
            .with("context", context);
        let outcome = self.process_task(task).await;

        if message.sender.is_none() {
            return Ok(());
        }
        let payload = into_payload(json!({
            "evaluation": outcome,
            "query": query,
        }));
        self.core
            .send_message(Message::reply_to(&message, MessageKind::Notification, payload))
            .await?;
        Ok(())
    }

    async fn on_request(&self, message: Message) -> AgentResult<()> {
        if message.payload_str("request_type") != Some("get_stats") {
            return handle_request(self, message).await;
        }
        if message.sender.is_none() {
            return Ok(());
        }
        let payload = into_payload(json!({ "stats": self.stats()? }));
        self.core
            .send_message(Message::reply_to(&message, MessageKind::Response, payload))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Agent for EvaluatorAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn handlers(&self) -> &HandlerTable<Self> {
        &self.handlers
    }

    async fn execute(&self, task: Task) -> AgentResult<Value> {
        match task.kind_or("evaluate") {
            "evaluate" => {
                let evaluation = self.evaluate(
                    task.get_str("query").unwrap_or_default(),
                    task.get_str("answer").unwrap_or_default(),
                    task.get_str("context").unwrap_or_default(),
                    task.get_str("ground_truth"),
                )?;
                Ok(serde_json::to_value(evaluation)?)
            }
            "get_stats" => self.stats(),
            other => Err(AgentError::UnknownOperation(format!("task type '{other}'"))),
        }
    }

    fn status_extras(&self) -> Payload {
        let state = self.lock();
        into_payload(json!({
            "evaluation_metrics": state.metrics,
            "history_size": state.history.len(),
        }))
    }
}

fn handle_response(agent: &EvaluatorAgent, message: Message) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_response(message))
}

fn handle_evaluator_request(
    agent: &EvaluatorAgent,
    message: Message,
) -> BoxFuture<'_, AgentResult<()>> {
    Box::pin(agent.on_request(message))
}
