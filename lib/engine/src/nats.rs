//! NATS JetStream provider for the event bus.
//!
//! Events are published to partitioned subjects
//! `operion.evt.<event_type>.<partition>`; the partition is derived from the
//! envelope key, so all messages for one `"{node_id}:{execution_id}"` pair
//! serialize on one subject. Each (consumer group, event type, partition)
//! triple gets a durable pull consumer with `max_ack_pending = 1`, which
//! keeps at most one delivery outstanding per partition and preserves the
//! FIFO guarantee across redeliveries.

use crate::bus::{partition_for_key, BusError, EventBus, EventHandler, HandlerError};
use crate::envelope::{Envelope, RawEnvelope};
use crate::event::EventType;
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Subject prefix for engine events.
const EVENTS_SUBJECT_PREFIX: &str = "operion.evt";

/// Stream name for engine events.
const EVENTS_STREAM_NAME: &str = "OPERION_EVENTS";

/// Default consumer group for worker processes.
const DEFAULT_CONSUMER_GROUP: &str = "operion-workers";

/// Default partition count.
const DEFAULT_PARTITIONS: u32 = 8;

/// Default bound on JetStream deliveries per message.
const DEFAULT_MAX_DELIVER: i64 = 5;

/// Default redelivery delay after a nack.
const DEFAULT_NAK_DELAY: Duration = Duration::from_secs(2);

/// Configuration for the NATS-backed event bus.
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name (defaults to OPERION_EVENTS).
    pub stream_name: Option<String>,
    /// Consumer group name (defaults to operion-workers).
    pub consumer_group: Option<String>,
    /// Partition count (defaults to 8). Must match across all producers and
    /// consumers of a deployment.
    pub partitions: Option<u32>,
    /// Maximum deliveries before JetStream stops redelivering (defaults to 5).
    pub max_deliver: Option<i64>,
    /// Redelivery delay after a nack (defaults to 2s).
    pub nak_delay: Option<Duration>,
}

impl NatsBusConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
            consumer_group: None,
            partitions: None,
            max_deliver: None,
            nak_delay: None,
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(EVENTS_STREAM_NAME)
    }

    fn group(&self) -> &str {
        self.consumer_group
            .as_deref()
            .unwrap_or(DEFAULT_CONSUMER_GROUP)
    }

    fn partition_count(&self) -> u32 {
        self.partitions.unwrap_or(DEFAULT_PARTITIONS).max(1)
    }

    fn delivery_bound(&self) -> i64 {
        self.max_deliver.unwrap_or(DEFAULT_MAX_DELIVER)
    }

    fn redelivery_delay(&self) -> Duration {
        self.nak_delay.unwrap_or(DEFAULT_NAK_DELAY)
    }

    /// Returns the subject for an event type and partition.
    fn subject(&self, event_type: EventType, partition: u32) -> String {
        format!("{EVENTS_SUBJECT_PREFIX}.{event_type}.{partition}")
    }

    /// Returns the durable consumer name for an event type and partition.
    fn consumer_name(&self, event_type: EventType, partition: u32) -> String {
        format!("{}-{}-p{}", self.group(), event_type, partition)
    }
}

/// NATS JetStream-based event bus.
pub struct NatsEventBus {
    client: async_nats::Client,
    jetstream: Arc<jetstream::Context>,
    config: NatsBusConfig,
    handlers: RwLock<HashMap<EventType, Arc<dyn EventHandler>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsEventBus {
    /// Connects to NATS and ensures the event stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn new(config: NatsBusConfig) -> Result<Self, BusError> {
        let client =
            async_nats::connect(&config.url)
                .await
                .map_err(|e| BusError::ConnectionFailed {
                    message: e.to_string(),
                })?;

        let jetstream = jetstream::new(client.clone());
        Self::ensure_stream(&jetstream, &config).await?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            jetstream: Arc::new(jetstream),
            config,
            handlers: RwLock::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Ensures the event stream exists.
    async fn ensure_stream(
        jetstream: &jetstream::Context,
        config: &NatsBusConfig,
    ) -> Result<(), BusError> {
        let stream_config = jetstream::stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{EVENTS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| BusError::ConnectionFailed {
                message: format!("failed to create events stream: {e}"),
            })?;

        Ok(())
    }

    /// Consumes one partition until shutdown.
    async fn consume_partition(
        consumer: jetstream::consumer::Consumer<pull::Config>,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
        nak_delay: Duration,
        subject: String,
    ) {
        use futures::StreamExt;

        let mut messages = match consumer.messages().await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(%subject, error = %e, "failed to open partition consumer");
                return;
            }
        };

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = messages.next() => {
                    let Some(result) = next else { break };
                    match result {
                        Ok(message) => {
                            Self::process_message(message, handler.as_ref(), nak_delay).await;
                        }
                        Err(e) => {
                            tracing::warn!(%subject, error = %e, "partition consumer error");
                        }
                    }
                }
            }
        }
    }

    /// Processes one delivered message: decode, invoke, ack or nack.
    async fn process_message(
        message: jetstream::Message,
        handler: &dyn EventHandler,
        nak_delay: Duration,
    ) {
        let envelope = match RawEnvelope::from_json_bytes(&message.payload) {
            Ok(raw) => raw.into_envelope(),
            Err(e) => {
                tracing::warn!(error = %e, "acking poison message with undecodable envelope");
                Self::ack(&message).await;
                return;
            }
        };

        let event = match envelope.decode_event() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "acking poison message with undecodable payload");
                Self::ack(&message).await;
                return;
            }
        };

        match handler.handle(event, &envelope.headers).await {
            Ok(()) => Self::ack(&message).await,
            Err(HandlerError::Fatal { message: reason }) => {
                tracing::error!(key = %envelope.headers.key, %reason, "handler failed fatally");
                Self::ack(&message).await;
            }
            Err(HandlerError::Retryable { message: reason }) => {
                tracing::warn!(key = %envelope.headers.key, %reason, "nacking for redelivery");
                if let Err(e) = message.ack_with(AckKind::Nak(Some(nak_delay))).await {
                    tracing::warn!(error = %e, "failed to nack message");
                }
            }
        }
    }

    async fn ack(message: &jetstream::Message) {
        if let Err(e) = message.ack().await {
            tracing::warn!(error = %e, "failed to ack message");
        }
    }

    /// Builds NATS headers mirroring the envelope headers.
    fn nats_headers(envelope: &Envelope<JsonValue>) -> async_nats::HeaderMap {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("event_type", envelope.headers.event_type.as_str());
        headers.insert("key", envelope.headers.key.as_str());
        if let Some(traceparent) = &envelope.headers.traceparent {
            headers.insert("traceparent", traceparent.as_str());
        }
        if let Some(tracestate) = &envelope.headers.tracestate {
            headers.insert("tracestate", tracestate.as_str());
        }
        headers
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("handler lock")
            .insert(event_type, handler);
    }

    async fn subscribe(&self) -> Result<(), BusError> {
        let stream = self
            .jetstream
            .get_stream(self.config.stream())
            .await
            .map_err(|e| BusError::SubscribeFailed {
                message: format!("failed to get stream: {e}"),
            })?;

        let registered: Vec<(EventType, Arc<dyn EventHandler>)> = {
            let handlers = self.handlers.read().expect("handler lock");
            handlers
                .iter()
                .map(|(event_type, handler)| (*event_type, handler.clone()))
                .collect()
        };

        let mut tasks = Vec::new();
        for (event_type, handler) in registered {
            for partition in 0..self.config.partition_count() {
                let subject = self.config.subject(event_type, partition);
                // max_ack_pending = 1 keeps one delivery in flight per
                // partition; nacked messages cannot be overtaken.
                let consumer_config = pull::Config {
                    durable_name: Some(self.config.consumer_name(event_type, partition)),
                    filter_subject: subject.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_deliver: self.config.delivery_bound(),
                    max_ack_pending: 1,
                    ..Default::default()
                };

                let consumer = stream
                    .get_or_create_consumer(
                        &self.config.consumer_name(event_type, partition),
                        consumer_config,
                    )
                    .await
                    .map_err(|e| BusError::SubscribeFailed {
                        message: format!("failed to create consumer for {subject}: {e}"),
                    })?;

                tasks.push(tokio::spawn(Self::consume_partition(
                    consumer,
                    handler.clone(),
                    self.shutdown.subscribe(),
                    self.config.redelivery_delay(),
                    subject,
                )));
            }
        }

        self.tasks.lock().expect("task lock").extend(tasks);
        Ok(())
    }

    async fn publish(&self, envelope: Envelope<JsonValue>) -> Result<(), BusError> {
        let Some(event_type) = envelope.headers.parsed_event_type() else {
            return Err(BusError::PublishFailed {
                message: format!("unknown event type: {}", envelope.headers.event_type),
            });
        };

        let partition = partition_for_key(&envelope.headers.key, self.config.partition_count());
        let subject = self.config.subject(event_type, partition);
        let headers = Self::nats_headers(&envelope);
        let bytes = envelope
            .to_json_bytes()
            .map_err(|e| BusError::PublishFailed {
                message: format!("failed to serialize envelope: {e}"),
            })?;

        self.jetstream
            .publish_with_headers(subject, headers, bytes.into())
            .await
            .map_err(|e| BusError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| BusError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        let _ = self.shutdown.send(true);

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task lock"));
        for task in tasks {
            let _ = task.await;
        }

        self.client.flush().await.map_err(|e| BusError::PublishFailed {
            message: format!("failed to flush on close: {e}"),
        })?;

        Ok(())
    }
}
