//! Single-consumer delivery loop shared by the bus backends

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{
    bus::MessageHandler,
    error::{MeshError, MeshResult},
    message::Message,
    metrics::{BusMetrics, BusMetricsCollector},
    types::AgentId,
};

/// Unit of work on the delivery queue
pub(crate) enum Envelope {
    /// Recipients are resolved from the message addressing at delivery time
    Routed(Message),
    /// Already fanned out by a remote backend; deliver to this subscriber only
    Addressed { to: AgentId, message: Message },
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub(crate) struct Dispatcher {
    subscribers: RwLock<HashMap<AgentId, Arc<dyn MessageHandler>>>,
    metrics: BusMetricsCollector,
    queue_tx: mpsc::UnboundedSender<Envelope>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    worker: Mutex<Option<Worker>>,
    stopped: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(metrics: BusMetricsCollector) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            subscribers: RwLock::new(HashMap::new()),
            metrics,
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn metrics(&self) -> &BusMetricsCollector {
        &self.metrics
    }

    /// Spawn the delivery loop if it is not already running
    pub(crate) fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::Release);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(shutdown_rx).await });
        *worker = Some(Worker { shutdown, handle });
    }

    /// Signal the delivery loop to exit after its current delivery
    pub(crate) fn halt(&self) {
        self.stopped.store(true, Ordering::Release);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            drop(worker.handle);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) async fn enqueue(&self, envelope: Envelope) -> MeshResult<()> {
        if self.is_stopped() {
            return Err(MeshError::BusStopped);
        }
        self.metrics.record_enqueued().await;
        if self.queue_tx.send(envelope).is_err() {
            self.metrics.record_dequeued().await;
            return Err(MeshError::BusStopped);
        }
        Ok(())
    }

    /// Register a handler, returning `true` if it replaced an earlier one
    pub(crate) async fn register(
        &self,
        agent_id: &AgentId,
        handler: Arc<dyn MessageHandler>,
    ) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let replaced = subscribers.insert(agent_id.clone(), handler).is_some();
        self.metrics.set_active_subscribers(subscribers.len()).await;
        replaced
    }

    pub(crate) async fn remove(&self, agent_id: &AgentId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let removed = subscribers.remove(agent_id).is_some();
        self.metrics.set_active_subscribers(subscribers.len()).await;
        removed
    }

    pub(crate) async fn snapshot(&self) -> BusMetrics {
        self.metrics.snapshot().await
    }

    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            while self.metrics.snapshot().await.queue_depth > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut queue = self.queue_rx.lock().await;
        debug!("Delivery loop started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                next = queue.recv() => match next {
                    Some(envelope) => {
                        self.deliver(envelope).await;
                        self.metrics.record_dequeued().await;
                    }
                    None => break,
                },
            }
        }

        debug!("Delivery loop stopped");
    }

    async fn deliver(&self, envelope: Envelope) {
        match envelope {
            Envelope::Routed(message) => match message.receiver.clone() {
                Some(receiver) => self.deliver_direct(&receiver, message).await,
                None => self.deliver_broadcast(message).await,
            },
            Envelope::Addressed { to, message } => self.deliver_direct(&to, message).await,
        }
    }

    async fn deliver_direct(&self, receiver: &AgentId, message: Message) {
        let handler = self.subscribers.read().await.get(receiver).cloned();
        match handler {
            Some(handler) => self.invoke(receiver, handler, message).await,
            None => {
                warn!(
                    receiver_id = %receiver,
                    message_id = %message.id,
                    message_type = %message.kind,
                    "No subscriber for direct message, dropping"
                );
                self.metrics.record_drop().await;
            }
        }
    }

    async fn deliver_broadcast(&self, message: Message) {
        let targets: Vec<(AgentId, Arc<dyn MessageHandler>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|(id, _)| message.sender.as_ref() != Some(*id))
            .map(|(id, handler)| (id.clone(), Arc::clone(handler)))
            .collect();

        debug!(
            message_id = %message.id,
            recipients = targets.len(),
            "Broadcasting message"
        );

        for (agent_id, handler) in targets {
            self.invoke(&agent_id, handler, message.clone()).await;
        }
    }

    async fn invoke(&self, agent_id: &AgentId, handler: Arc<dyn MessageHandler>, message: Message) {
        let message_id = message.id;
        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => self.metrics.record_delivery().await,
            Ok(Err(e)) => {
                error!(
                    agent_id = %agent_id,
                    message_id = %message_id,
                    error = %e,
                    "Message handler failed"
                );
                self.metrics.record_delivery_failure().await;
            }
            Err(panic) => {
                error!(
                    agent_id = %agent_id,
                    message_id = %message_id,
                    panic = panic_message(panic.as_ref()),
                    "Message handler panicked"
                );
                self.metrics.record_delivery_failure().await;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
