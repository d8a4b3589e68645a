//! Expert records and in-flight routes

use chrono::{DateTime, Utc};
use conclave_mesh::{AgentId, MessageId, Payload};
use serde::Serialize;

use super::classifier::QueryCategory;

/// An expert agent the router may dispatch to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpertRecord {
    pub expert_id: AgentId,
    pub categories: Vec<String>,
    pub metadata: Payload,
    pub registered_at: DateTime<Utc>,
    /// Dispatched queries not yet answered
    pub load: u64,
    pub total_queries: u64,
    /// Answered queries; the denominator of `avg_response_time`
    pub responses: u64,
    /// Mean seconds from dispatch to answer
    pub avg_response_time: f64,
}

impl ExpertRecord {
    pub fn new(expert_id: AgentId, categories: Vec<String>, metadata: Payload) -> Self {
        Self {
            expert_id,
            categories,
            metadata,
            registered_at: Utc::now(),
            load: 0,
            total_queries: 0,
            responses: 0,
            avg_response_time: 0.0,
        }
    }

    pub fn handles(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    /// Fold one answer's latency into the running mean
    pub fn record_response(&mut self, seconds: f64) {
        self.responses += 1;
        self.avg_response_time += (seconds - self.avg_response_time) / self.responses as f64;
    }
}

/// Experts in registration order
#[derive(Debug, Clone, Default)]
pub struct ExpertRegistry {
    experts: Vec<ExpertRecord>,
}

impl ExpertRegistry {
    /// Insert or replace by id; a replaced expert keeps its position
    ///
    /// Returns `true` if an existing record was replaced.
    pub fn register(&mut self, record: ExpertRecord) -> bool {
        match self
            .experts
            .iter_mut()
            .find(|e| e.expert_id == record.expert_id)
        {
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                self.experts.push(record);
                false
            }
        }
    }

    pub fn get(&self, expert_id: &AgentId) -> Option<&ExpertRecord> {
        self.experts.iter().find(|e| &e.expert_id == expert_id)
    }

    pub fn get_mut(&mut self, expert_id: &AgentId) -> Option<&mut ExpertRecord> {
        self.experts.iter_mut().find(|e| &e.expert_id == expert_id)
    }

    /// Experts registered for `category` or for `general`
    pub fn eligible(&self, category: QueryCategory) -> Vec<&ExpertRecord> {
        let general = QueryCategory::General.as_str();
        self.experts
            .iter()
            .filter(|e| e.handles(category.as_str()) || e.handles(general))
            .collect()
    }

    /// Experts registered for exactly `category`
    pub fn registered_for(&self, category: QueryCategory) -> Vec<&ExpertRecord> {
        self.experts
            .iter()
            .filter(|e| e.handles(category.as_str()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpertRecord> {
        self.experts.iter()
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }
}

/// A dispatched query awaiting its expert's answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRoute {
    /// Id of the query sent to the expert
    pub message_id: MessageId,
    pub expert_id: AgentId,
    pub category: QueryCategory,
    pub requester_id: AgentId,
    pub routed_at: DateTime<Utc>,
    pub query: String,
}
