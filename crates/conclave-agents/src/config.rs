//! # System Configuration
//!
//! Settings for a full agent system: the bus plus every role's tunables.
//!
//! ## Environment Variables
//!
//! Bus variables are documented on [`BusConfig`]. In addition:
//!
//! - `CONCLAVE_ROUTER_STRATEGY` - round_robin, least_loaded or performance_based (default: round_robin)
//! - `CONCLAVE_COMPLETED_HISTORY` - Finished workflows kept by the coordinator (default: 50)
//! - `CONCLAVE_HEARTBEAT_TIMEOUT_SECS` - Heartbeat age after which an agent is unhealthy (default: 60)
//! - `CONCLAVE_DEFAULT_WORKER_ID` - Worker used when a query names none (default: rag_agent_001)
//! - `CONCLAVE_DEFAULT_EVALUATOR_ID` - Evaluator used when a query names none; empty disables evaluation (default: evaluator_agent_001)
//! - `CONCLAVE_CACHE_TTL_SECS` - Worker answer cache lifetime (default: 300)
//! - `CONCLAVE_DEFAULT_TOP_K` - Documents requested per query (default: 5)
//! - `CONCLAVE_QUALITY_THRESHOLD` - Minimum passing quality score (default: 0.7)

use conclave_mesh::{AgentId, BusConfig, ConfigError};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::{
    coordinator::{CoordinatorSettings, DEFAULT_HISTORY_CAPACITY},
    core::DEFAULT_HEARTBEAT_TIMEOUT,
    evaluator::DEFAULT_QUALITY_THRESHOLD,
    retrieval::{DEFAULT_CACHE_TTL, DEFAULT_TOP_K, RetrievalSettings},
    router::LoadBalancingStrategy,
};

/// Settings for every agent role and the bus they share
#[derive(Debug, Clone, PartialEq)]
pub struct SystemConfig {
    pub bus: BusConfig,
    pub router_strategy: LoadBalancingStrategy,
    pub completed_history: usize,
    pub heartbeat_timeout: Duration,
    pub default_worker: AgentId,
    pub default_evaluator: Option<AgentId>,
    pub cache_ttl: Duration,
    pub top_k: u64,
    pub quality_threshold: f64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            router_strategy: LoadBalancingStrategy::RoundRobin,
            completed_history: DEFAULT_HISTORY_CAPACITY,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            default_worker: AgentId::from("rag_agent_001"),
            default_evaluator: Some(AgentId::from("evaluator_agent_001")),
            cache_ttl: DEFAULT_CACHE_TTL,
            top_k: DEFAULT_TOP_K,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
        }
    }
}

impl SystemConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any environment variable has an invalid value
    /// or if the configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            bus: BusConfig::from_env()?,
            ..Self::default()
        };

        if let Ok(strategy) = env::var("CONCLAVE_ROUTER_STRATEGY") {
            config.router_strategy = strategy.parse().unwrap_or_default();
        }
        if let Some(history) = get_env_parsed::<usize>("CONCLAVE_COMPLETED_HISTORY")? {
            config.completed_history = history;
        }
        if let Some(secs) = get_env_parsed::<u64>("CONCLAVE_HEARTBEAT_TIMEOUT_SECS")? {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Ok(worker) = env::var("CONCLAVE_DEFAULT_WORKER_ID") {
            config.default_worker = parse_agent_id("CONCLAVE_DEFAULT_WORKER_ID", &worker)?;
        }
        if let Ok(evaluator) = env::var("CONCLAVE_DEFAULT_EVALUATOR_ID") {
            config.default_evaluator = if evaluator.is_empty() {
                None
            } else {
                Some(parse_agent_id("CONCLAVE_DEFAULT_EVALUATOR_ID", &evaluator)?)
            };
        }
        if let Some(secs) = get_env_parsed::<u64>("CONCLAVE_CACHE_TTL_SECS")? {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(top_k) = get_env_parsed::<u64>("CONCLAVE_DEFAULT_TOP_K")? {
            config.top_k = top_k;
        }
        if let Some(threshold) = get_env_parsed::<f64>("CONCLAVE_QUALITY_THRESHOLD")? {
            config.quality_threshold = threshold;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;

        if self.completed_history == 0 {
            return Err(ConfigError::ValidationError(
                "completed_history must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat_timeout must be greater than 0".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "top_k must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "quality_threshold must be between 0 and 1, got {}",
                self.quality_threshold
            )));
        }
        if let LoadBalancingStrategy::Unrecognized(name) = &self.router_strategy {
            warn!(
                strategy = %name,
                "Unrecognized router strategy, the first eligible expert will be used"
            );
        }
        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            default_worker: self.default_worker.clone(),
            default_evaluator: self.default_evaluator.clone(),
            history_capacity: self.completed_history,
            top_k: self.top_k,
        }
    }

    pub fn retrieval_settings(&self) -> RetrievalSettings {
        RetrievalSettings {
            cache_ttl: self.cache_ttl,
            top_k: self.top_k,
            ..RetrievalSettings::default()
        }
    }
}

fn get_env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_agent_id(key: &str, value: &str) -> Result<AgentId, ConfigError> {
    AgentId::parse(value).map_err(|e| ConfigError::InvalidEnvVar {
        key: key.to_string(),
        message: e.to_string(),
    })
}
