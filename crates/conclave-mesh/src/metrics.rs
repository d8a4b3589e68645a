//! Delivery counters shared by every bus backend

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Point-in-time view of a bus
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusMetrics {
    /// Backend label (`in_memory` or `redis`)
    pub backend: String,
    /// Messages accepted by `publish`
    pub published: u64,
    /// Handler invocations that completed without error
    pub delivered: u64,
    /// Direct messages whose receiver had no subscriber
    pub dropped: u64,
    /// Handler invocations that returned an error or panicked
    pub delivery_failures: u64,
    /// Errors reported by the transport (decode failures, lost connections)
    pub backend_errors: u64,
    pub active_subscribers: usize,
    /// Envelopes queued or being delivered on this process
    pub queue_depth: usize,
    /// Transport endpoint, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Counter store updated by the delivery loop
pub struct BusMetricsCollector {
    metrics: Arc<RwLock<BusMetrics>>,
}

impl BusMetricsCollector {
    pub fn new(backend: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(BusMetrics {
                backend: backend.into(),
                endpoint,
                ..BusMetrics::default()
            })),
        }
    }

    /// Record a message accepted for delivery
    pub async fn record_publish(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.published = metrics.published.saturating_add(1);
    }

    pub async fn record_enqueued(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.queue_depth = metrics.queue_depth.saturating_add(1);
    }

    pub async fn record_dequeued(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.queue_depth = metrics.queue_depth.saturating_sub(1);
    }

    pub async fn record_delivery(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.delivered = metrics.delivered.saturating_add(1);
    }

    pub async fn record_drop(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.dropped = metrics.dropped.saturating_add(1);
    }

    pub async fn record_delivery_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.delivery_failures = metrics.delivery_failures.saturating_add(1);
    }

    pub async fn record_backend_error(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.backend_errors = metrics.backend_errors.saturating_add(1);
    }

    pub async fn set_active_subscribers(&self, count: usize) {
        self.metrics.write().await.active_subscribers = count;
    }

    /// Get current metrics snapshot
    pub async fn snapshot(&self) -> BusMetrics {
        self.metrics.read().await.clone()
    }
}

impl Clone for BusMetricsCollector {
    fn clone(&self) -> Self {
        Self {
            metrics: Arc::clone(&self.metrics),
        }
    }
}
