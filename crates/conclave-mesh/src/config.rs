//! # Bus Configuration
//!
//! Backend selection for the message bus, loadable from the environment.
//!
//! ## Environment Variables
//!
//! - `CONCLAVE_BUS_BACKEND` - `memory` or `redis` (default: memory)
//! - `CONCLAVE_REDIS_URL` - Redis connection URL (default: redis://localhost:6379)
//! - `CONCLAVE_REDIS_CHANNEL_PREFIX` - Prefix for every Redis channel (default: empty)
//! - `CONCLAVE_REDIS_POOL_SIZE` - Publishing connection pool size (default: 10)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{bus::MessageBus, memory::InMemoryBus};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Transport used by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusBackend {
    #[default]
    InMemory,
    Redis,
}

impl FromStr for BusBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "in_memory" | "inmemory" => Ok(Self::InMemory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown bus backend '{other}', expected memory/redis")),
        }
    }
}

impl fmt::Display for BusBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => f.write_str("in_memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

/// Bus settings
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub redis_url: String,
    pub channel_prefix: String,
    pub pool_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::InMemory,
            redis_url: "redis://localhost:6379".to_string(),
            channel_prefix: String::new(),
            pool_size: 10,
        }
    }
}

impl BusConfig {
    /// In-memory bus with defaults
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Redis bus at `url`
    #[must_use]
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            backend: BusBackend::Redis,
            redis_url: url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any environment variable has an invalid value
    /// or if the configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(backend) = get_env_string("CONCLAVE_BUS_BACKEND") {
            config.backend = backend.parse().map_err(|message| ConfigError::InvalidEnvVar {
                key: "CONCLAVE_BUS_BACKEND".to_string(),
                message,
            })?;
        }
        if let Some(url) = get_env_string("CONCLAVE_REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(prefix) = get_env_string("CONCLAVE_REDIS_CHANNEL_PREFIX") {
            config.channel_prefix = prefix;
        }
        if let Some(size) = get_env_usize("CONCLAVE_REDIS_POOL_SIZE")? {
            config.pool_size = size;
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
        if self.backend == BusBackend::Redis {
            if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
                return Err(ConfigError::ValidationError(format!(
                    "redis_url must start with redis:// or rediss://, got '{}'",
                    self.redis_url
                )));
            }
            if self.pool_size == 0 {
                return Err(ConfigError::ValidationError(
                    "pool_size must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Build the configured bus
///
/// If Redis is requested but unreachable (or support is not compiled in) the
/// failure is logged and an in-memory bus is returned instead. The returned
/// bus is not started.
pub async fn create_bus(config: &BusConfig) -> Arc<dyn MessageBus> {
    match config.backend {
        BusBackend::InMemory => Arc::new(InMemoryBus::new()),
        BusBackend::Redis => create_redis_bus(config).await,
    }
}

#[cfg(feature = "redis")]
async fn create_redis_bus(config: &BusConfig) -> Arc<dyn MessageBus> {
    use crate::redis::{RedisBus, RedisConfig};

    let redis_config = RedisConfig::new(config.redis_url.clone())
        .with_pool_size(config.pool_size)
        .with_channel_prefix(config.channel_prefix.clone());

    match RedisBus::with_config(redis_config).await {
        Ok(bus) => {
            info!(url = %config.redis_url, "Using Redis message bus");
            Arc::new(bus)
        }
        Err(e) => {
            warn!(
                url = %config.redis_url,
                error = %e,
                "Redis unavailable, falling back to in-memory message bus"
            );
            Arc::new(InMemoryBus::new())
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn create_redis_bus(config: &BusConfig) -> Arc<dyn MessageBus> {
    warn!(
        url = %config.redis_url,
        "Redis support not compiled in, falling back to in-memory message bus"
    );
    Arc::new(InMemoryBus::new())
}

fn get_env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid usize value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}
