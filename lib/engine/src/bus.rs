//! Event bus contract and the in-memory provider.
//!
//! The bus is a partitioned publish/subscribe system with at-least-once
//! delivery. Messages carry a partition key; messages with the same key land
//! on the same partition and are consumed in order by a single group member.
//! This per-partition FIFO is the only ordering guarantee the engine relies
//! on.
//!
//! Handler outcome contract:
//! - `Ok(())` — the message is acked.
//! - `Err(HandlerError::Retryable)` — the message is nacked and redelivered
//!   after the provider's backoff.
//! - `Err(HandlerError::Fatal)` — the message is logged and acked.
//! - Undecodable payloads are poison: logged and acked, never redelivered.

use crate::envelope::{Envelope, EventHeaders};
use crate::event::{EventType, WorkflowEvent};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::sync::watch;

/// Errors from bus operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Failed to connect to the bus.
    ConnectionFailed { message: String },
    /// Failed to publish a message.
    PublishFailed { message: String },
    /// Failed to begin consuming.
    SubscribeFailed { message: String },
    /// The bus has been closed.
    Closed,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "bus connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "publish failed: {message}"),
            Self::SubscribeFailed { message } => write!(f, "subscribe failed: {message}"),
            Self::Closed => write!(f, "bus is closed"),
        }
    }
}

impl std::error::Error for BusError {}

/// Errors returned by event handlers, deciding the ack/nack disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; the message is nacked and redelivered.
    Retryable { message: String },
    /// Permanent failure; the message is logged and acked.
    Fatal { message: String },
}

impl HandlerError {
    /// Creates a retryable handler error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Creates a fatal handler error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable { message } => write!(f, "retryable handler failure: {message}"),
            Self::Fatal { message } => write!(f, "fatal handler failure: {message}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// A typed event handler.
///
/// The bus decodes the payload into the concrete event shape, directed by
/// the `event_type` header, before invoking the handler. Delivery is
/// at-least-once; handlers must be idempotent with respect to the
/// input-coordination store.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one delivered event.
    async fn handle(
        &self,
        event: WorkflowEvent,
        headers: &EventHeaders,
    ) -> Result<(), HandlerError>;
}

/// The event bus contract.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Registers a typed handler for an event type.
    ///
    /// Registration must happen before `subscribe`; the handler set is
    /// read-only afterwards.
    fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>);

    /// Begins consuming all registered event types.
    async fn subscribe(&self) -> Result<(), BusError>;

    /// Serializes and publishes a message; the envelope key governs
    /// partition placement.
    async fn publish(&self, envelope: Envelope<JsonValue>) -> Result<(), BusError>;

    /// Flushes and shuts down.
    async fn close(&self) -> Result<(), BusError>;
}

/// Maps a partition key onto one of `partitions` partitions.
///
/// FNV-1a keeps the mapping stable across processes and restarts, which the
/// FIFO loop invariant depends on.
#[must_use]
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

/// Default bound on in-memory redelivery attempts per message.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

struct InMemoryInner {
    partitions: u32,
    max_attempts: u32,
    handlers: RwLock<HashMap<EventType, Arc<dyn EventHandler>>>,
    /// FIFO queues keyed by (topic, partition).
    queues: Mutex<BTreeMap<(String, u32), VecDeque<Envelope<JsonValue>>>>,
    /// Serializes drains so per-partition order holds even with concurrent
    /// pump callers.
    pump_guard: tokio::sync::Mutex<()>,
    notify: Notify,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    history: Option<Mutex<Vec<Envelope<JsonValue>>>>,
}

/// In-process event bus provider.
///
/// Backs single-process deployments and tests. Partition FIFO is preserved
/// by draining one message at a time per queue; retryable failures are
/// redelivered in place (bounded) so later messages on the partition cannot
/// overtake.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<InMemoryInner>,
}

impl InMemoryEventBus {
    /// Creates an in-memory bus with the given partition count.
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self::build(partitions, DEFAULT_MAX_ATTEMPTS, false)
    }

    /// Creates a bus that records every published envelope, for tests.
    #[must_use]
    pub fn recording(partitions: u32) -> Self {
        Self::build(partitions, DEFAULT_MAX_ATTEMPTS, true)
    }

    /// Sets the redelivery bound.
    #[must_use]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self::build(
            self.inner.partitions,
            max_attempts.max(1),
            self.inner.history.is_some(),
        )
    }

    fn build(partitions: u32, max_attempts: u32, record_history: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(InMemoryInner {
                partitions: partitions.max(1),
                max_attempts,
                handlers: RwLock::new(HashMap::new()),
                queues: Mutex::new(BTreeMap::new()),
                pump_guard: tokio::sync::Mutex::new(()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                shutdown,
                consumer: Mutex::new(None),
                history: record_history.then(|| Mutex::new(Vec::new())),
            }),
        }
    }

    /// Returns every envelope published so far.
    ///
    /// Empty unless the bus was created with [`InMemoryEventBus::recording`].
    #[must_use]
    pub fn history(&self) -> Vec<Envelope<JsonValue>> {
        self.inner
            .history
            .as_ref()
            .map(|h| h.lock().expect("history lock").clone())
            .unwrap_or_default()
    }

    /// Returns the partition a key maps to on this bus.
    #[must_use]
    pub fn partition_of(&self, key: &str) -> u32 {
        partition_for_key(key, self.inner.partitions)
    }

    /// Drains all queued messages in partition order, invoking handlers.
    ///
    /// Returns the number of messages processed. Messages published by
    /// handlers during the drain are processed before returning, so after
    /// `pump` returns the graph has advanced as far as it can.
    pub async fn pump(&self) -> usize {
        let _guard = self.inner.pump_guard.lock().await;
        let mut processed = 0;

        loop {
            let next = {
                let mut queues = self.inner.queues.lock().expect("queue lock");
                let key = queues
                    .iter()
                    .find(|(_, queue)| !queue.is_empty())
                    .map(|(key, _)| key.clone());
                match key {
                    Some(key) => queues.get_mut(&key).and_then(VecDeque::pop_front),
                    None => None,
                }
            };

            let Some(envelope) = next else { break };
            self.deliver(envelope).await;
            processed += 1;
        }

        processed
    }

    async fn deliver(&self, envelope: Envelope<JsonValue>) {
        let Some(event_type) = envelope.headers.parsed_event_type() else {
            tracing::warn!(
                event_type = %envelope.headers.event_type,
                "dropping poison message with unknown event type"
            );
            return;
        };

        let handler = {
            let handlers = self.inner.handlers.read().expect("handler lock");
            handlers.get(&event_type).cloned()
        };
        let Some(handler) = handler else {
            tracing::debug!(%event_type, "no handler registered, dropping message");
            return;
        };

        let event = match envelope.decode_event() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%event_type, error = %e, "dropping poison message");
                return;
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match handler.handle(event.clone(), &envelope.headers).await {
                Ok(()) => return,
                Err(HandlerError::Fatal { message }) => {
                    tracing::error!(%event_type, key = %envelope.headers.key, %message, "handler failed fatally");
                    return;
                }
                Err(HandlerError::Retryable { message }) => {
                    if attempts >= self.inner.max_attempts {
                        tracing::error!(
                            %event_type,
                            key = %envelope.headers.key,
                            attempts,
                            %message,
                            "redelivery budget exhausted, dropping message"
                        );
                        return;
                    }
                    tracing::warn!(%event_type, key = %envelope.headers.key, attempts, %message, "redelivering");
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.inner
            .handlers
            .write()
            .expect("handler lock")
            .insert(event_type, handler);
    }

    async fn subscribe(&self) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let bus = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = bus.inner.notify.notified() => {
                        bus.pump().await;
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            // Drain anything that raced the shutdown signal.
            bus.pump().await;
        });

        let mut consumer = self.inner.consumer.lock().expect("consumer lock");
        if let Some(previous) = consumer.replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    async fn publish(&self, envelope: Envelope<JsonValue>) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let partition = partition_for_key(&envelope.headers.key, self.inner.partitions);
        let topic = envelope.headers.event_type.clone();

        if let Some(history) = &self.inner.history {
            history.lock().expect("history lock").push(envelope.clone());
        }

        self.inner
            .queues
            .lock()
            .expect("queue lock")
            .entry((topic, partition))
            .or_default()
            .push_back(envelope);
        self.inner.notify.notify_one();

        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);

        let handle = self.inner.consumer.lock().expect("consumer lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeActivation;
    use crate::node::NodeId;
    use operion_core::{ExecutionId, PublishedWorkflowId};
    use std::sync::atomic::AtomicU32;

    fn activation_envelope(node_id: NodeId, execution_id: ExecutionId) -> Envelope<JsonValue> {
        let event = WorkflowEvent::NodeActivation(NodeActivation::new(
            PublishedWorkflowId::new(),
            execution_id,
            node_id,
            "in",
            HashMap::new(),
            NodeId::new(),
            "out",
        ));
        Envelope::from_event(&event, None, None).expect("wrap")
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        failure: fn(String) -> HandlerError,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                failure: |message| HandlerError::Retryable { message },
            })
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(
            &self,
            _event: WorkflowEvent,
            _headers: &EventHeaders,
        ) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err((self.failure)("induced".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn partition_mapping_is_stable() {
        let key = "node_x:exec_y";
        let first = partition_for_key(key, 8);
        let second = partition_for_key(key, 8);
        assert_eq!(first, second);
        assert!(first < 8);
    }

    #[test]
    fn different_partition_counts_stay_in_range() {
        for partitions in [1, 2, 7, 64] {
            let partition = partition_for_key("some:key", partitions);
            assert!(partition < partitions);
        }
    }

    #[tokio::test]
    async fn pump_delivers_registered_events() {
        let bus = InMemoryEventBus::new(4);
        let handler = CountingHandler::new();
        bus.register(EventType::NodeActivation, handler.clone());

        bus.publish(activation_envelope(NodeId::new(), ExecutionId::new()))
            .await
            .unwrap();
        let processed = bus.pump().await;

        assert_eq!(processed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failures_redeliver_in_place() {
        let bus = InMemoryEventBus::new(4);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
            failure: |message| HandlerError::Retryable { message },
        });
        bus.register(EventType::NodeActivation, handler.clone());

        bus.publish(activation_envelope(NodeId::new(), ExecutionId::new()))
            .await
            .unwrap();
        bus.pump().await;

        // Two failures then success.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redelivery_budget_is_bounded() {
        let bus = InMemoryEventBus::new(4).with_max_attempts(3);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            failure: |message| HandlerError::Retryable { message },
        });
        bus.register(EventType::NodeActivation, handler.clone());

        bus.publish(activation_envelope(NodeId::new(), ExecutionId::new()))
            .await
            .unwrap();
        bus.pump().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failures_ack_without_redelivery() {
        let bus = InMemoryEventBus::new(4);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            failure: |message| HandlerError::Fatal { message },
        });
        bus.register(EventType::NodeActivation, handler.clone());

        bus.publish(activation_envelope(NodeId::new(), ExecutionId::new()))
            .await
            .unwrap();
        bus.pump().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poison_payload_is_dropped() {
        let bus = InMemoryEventBus::new(4);
        let handler = CountingHandler::new();
        bus.register(EventType::NodeActivation, handler.clone());

        let headers = EventHeaders::new(EventType::NodeActivation, "k");
        bus.publish(Envelope::new(headers, serde_json::json!("not an event")))
            .await
            .unwrap();
        bus.pump().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let bus = InMemoryEventBus::recording(8);
        let node_id = NodeId::new();
        let execution_id = ExecutionId::new();

        for _ in 0..5 {
            bus.publish(activation_envelope(node_id, execution_id))
                .await
                .unwrap();
        }

        let partitions: std::collections::HashSet<u32> = bus
            .history()
            .iter()
            .map(|e| bus.partition_of(&e.headers.key))
            .collect();
        assert_eq!(partitions.len(), 1);
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let bus = InMemoryEventBus::new(2);
        bus.close().await.unwrap();

        let err = bus
            .publish(activation_envelope(NodeId::new(), ExecutionId::new()))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Closed);
    }
}
