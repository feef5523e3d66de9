//! Message Router
//!
//! Single ingress point for inter-agent messages. `send()` only enqueues; one
//! consumer loop (`run()`) dequeues with a bounded wait and:
//!   - applies HEARTBEAT and STATUS_UPDATE registry writes on the loop itself,
//!     in dequeue order; a HEARTBEAT stops there
//!   - dispatches everything else to the recipient's handler and, additively,
//!     to every subscriber registered for the message type
//!   - turns handler failures into ERROR replies to the sender (never for a
//!     failing ERROR message, so errors cannot ping-pong)

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::queue::{MessageQueue, QueueOrdering, QueueStats};
use super::registry::AgentRegistry;
use super::traits::SharedHandler;
use super::types::{Message, MessageType, StatusEvent};
use crate::coordination::ShutdownController;

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Bounded wait for one dequeue attempt (ms)
    pub poll_timeout_ms: u64,
    /// Maximum messages being handled concurrently
    pub worker_pool_size: usize,
    /// How long `run()` waits for in-flight handlers on shutdown (ms)
    pub drain_timeout_ms: u64,
    /// FIFO (default) or priority dequeue order
    pub ordering: QueueOrdering,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            worker_pool_size: 8,
            drain_timeout_ms: 5000,
            ordering: QueueOrdering::Fifo,
        }
    }
}

impl RouterConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Routing statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct RouterStats {
    /// Messages taken off the queue (or delivered directly)
    pub messages_received: u64,
    /// Messages that reached at least one handler
    pub messages_dispatched: u64,
    /// Messages nobody handles (dropped silently)
    pub messages_dropped: u64,
    pub heartbeats: u64,
    pub status_updates: u64,
    pub handler_errors: u64,
    pub error_replies: u64,
    pub by_type: HashMap<MessageType, u64>,
}

/// Clone-friendly router handle; every clone shares the same queue
#[derive(Clone)]
pub struct MessageRouter {
    config: RouterConfig,
    registry: AgentRegistry,
    queue: Arc<Mutex<MessageQueue>>,
    queue_ready: Arc<Notify>,
    closed: Arc<AtomicBool>,
    subscribers: Arc<RwLock<HashMap<MessageType, Vec<SharedHandler>>>>,
    workers: Arc<Semaphore>,
    stats: Arc<RwLock<RouterStats>>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, registry: AgentRegistry) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            queue: Arc::new(Mutex::new(MessageQueue::new(config.ordering))),
            queue_ready: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RouterStats::default())),
            workers,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    // ==================== Ingress ====================

    /// Enqueue a message. Never waits for a consumer; returns false only when
    /// the queue has been closed.
    pub async fn send(&self, message: Message) -> bool {
        if self.is_closed() {
            debug!(id = %message.id, kind = %message.message_type, "queue closed, message rejected");
            return false;
        }

        self.queue.lock().await.enqueue(message);
        self.queue_ready.notify_one();
        true
    }

    /// Dequeue one message, waiting at most `wait`
    pub async fn recv(&self, wait: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.queue_ready.notified();
            if let Some(message) = self.queue.lock().await.dequeue() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Reject further sends and drop everything still queued.
    /// Returns the number of dropped messages.
    pub async fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = self.queue.lock().await.clear();
        self.queue_ready.notify_waiters();
        if dropped > 0 {
            warn!(dropped, "dropped undelivered messages on close");
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ==================== Subscriptions ====================

    /// Add a type-level subscriber (in addition to recipient dispatch)
    pub async fn subscribe(&self, message_type: MessageType, handler: SharedHandler) {
        self.subscribers
            .write()
            .await
            .entry(message_type)
            .or_default()
            .push(handler);
        debug!(kind = %message_type, "added message subscriber");
    }

    /// Remove a subscriber by identity. Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, message_type: MessageType, handler: &SharedHandler) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let Some(list) = subscribers.get_mut(&message_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&message_type);
        }
        removed
    }

    pub async fn subscriber_count(&self, message_type: MessageType) -> usize {
        self.subscribers
            .read()
            .await
            .get(&message_type)
            .map_or(0, Vec::len)
    }

    // ==================== Processing ====================

    /// Process one message to completion (registry update and/or dispatch).
    ///
    /// Delivers a message directly, bypassing the queue. `run()` splits the
    /// same work: registry effects inline, dispatch on the worker pool.
    pub async fn process(&self, message: Message) {
        if self.apply_registry_effects(&message).await {
            self.dispatch(message).await;
        }
    }

    /// Counters and registry writes for one message. Returns whether the
    /// message still has to be dispatched to handlers.
    async fn apply_registry_effects(&self, message: &Message) -> bool {
        {
            let mut stats = self.stats.write().await;
            stats.messages_received += 1;
            *stats.by_type.entry(message.message_type).or_insert(0) += 1;
        }

        match message.message_type {
            MessageType::Heartbeat => {
                self.apply_heartbeat(message).await;
                false
            }
            MessageType::StatusUpdate => {
                self.apply_status_update(message).await;
                true
            }
            _ => true,
        }
    }

    async fn apply_heartbeat(&self, message: &Message) {
        // Clamp skewed clocks so a future timestamp cannot suppress timeouts
        let at = message.timestamp.min(Utc::now());
        if self
            .registry
            .record_heartbeat(&message.sender, at, &message.metrics())
            .await
        {
            self.stats.write().await.heartbeats += 1;
        }
    }

    async fn apply_status_update(&self, message: &Message) {
        let metrics = message.metrics();
        if !metrics.is_empty() {
            self.registry.merge_metrics(&message.sender, &metrics).await;
        }
        if let Some(status) = message.reported_status() {
            if self
                .registry
                .apply_status(&message.sender, StatusEvent::Reported(status))
                .await
                .is_some()
            {
                self.stats.write().await.status_updates += 1;
            }
        }
    }

    async fn dispatch(&self, message: Message) {
        let mut targets: Vec<SharedHandler> = Vec::new();
        if let Some(handler) = self.registry.handler(&message.recipient).await {
            targets.push(handler);
        }
        if let Some(subscribers) = self.subscribers.read().await.get(&message.message_type) {
            targets.extend(subscribers.iter().cloned());
        }

        if targets.is_empty() {
            debug!(
                id = %message.id,
                kind = %message.message_type,
                recipient = %message.recipient,
                "no handler or subscriber, dropping message"
            );
            self.stats.write().await.messages_dropped += 1;
            return;
        }

        self.stats.write().await.messages_dispatched += 1;

        for handler in targets {
            if let Err(error) = invoke(handler, message.clone()).await {
                self.handle_failure(&message, &error).await;
            }
        }
    }

    async fn handle_failure(&self, message: &Message, error: &str) {
        error!(
            id = %message.id,
            kind = %message.message_type,
            sender = %message.sender,
            recipient = %message.recipient,
            error,
            "message handler failed"
        );

        self.registry.record_error(&message.sender, error).await;
        self.stats.write().await.handler_errors += 1;

        if message.message_type == MessageType::Error {
            debug!(id = %message.id, "not replying to a failed ERROR message");
            return;
        }

        if self.send(message.error_reply(error)).await {
            self.stats.write().await.error_replies += 1;
        } else {
            warn!(id = %message.id, "queue closed, error reply not sent");
        }
    }

    // ==================== Consumer loop ====================

    /// Consumer loop. Runs until shutdown, then waits (bounded) for
    /// in-flight handlers.
    pub async fn run(self, shutdown: ShutdownController) {
        let mut shutdown_rx = shutdown.subscribe();
        let poll_timeout = self.config.poll_timeout();
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            workers = self.config.worker_pool_size,
            ordering = ?self.config.ordering,
            "message router started"
        );

        while shutdown.is_running() {
            let next = tokio::select! {
                _ = shutdown_rx.recv() => break,
                next = self.recv(poll_timeout) => next,
            };

            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    error!("message worker task failed: {}", e);
                }
            }

            let Some(message) = next else {
                continue;
            };

            // Registry writes stay in dequeue order; only handlers run on workers
            if !self.apply_registry_effects(&message).await {
                continue;
            }

            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let router = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                router.dispatch(message).await;
            });
        }

        self.drain(in_flight).await;
        info!("message router stopped");
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        info!(pending = in_flight.len(), "waiting for in-flight handlers");
        let drained = tokio::time::timeout(self.config.drain_timeout(), async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                "drain timeout, aborting in-flight handlers"
            );
            in_flight.abort_all();
        }
    }

    // ==================== Queries ====================

    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.lock().await.stats()
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }
}

/// Run a handler on its own task so a panic is contained and reported as a
/// failure instead of unwinding through the router.
async fn invoke(handler: SharedHandler, message: Message) -> Result<(), String> {
    let task = tokio::spawn(async move { handler.handle(message).await });
    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(join_err) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            let text = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("handler panicked: {text}"))
        }
        Err(join_err) => Err(format!("handler task cancelled: {join_err}")),
    }
}
