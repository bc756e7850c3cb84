//! Versioned envelope for bus messages.
//!
//! Every message crossing the bus carries a version field and the mandatory
//! headers: `event_type` (the topic, duplicated into the payload for routing
//! correctness), `key` (the partition key), and the opaque `traceparent` /
//! `tracestate` pair. Providers that support native headers (NATS) mirror
//! them there; the envelope remains the source of truth for decoding.

use crate::event::{EventType, WorkflowEvent};
use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// Mandatory message headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeaders {
    /// Topic name, duplicated for routing correctness.
    pub event_type: String,
    /// The partition key.
    pub key: String,
    /// W3C trace parent, propagated opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    /// W3C trace state, propagated opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

impl EventHeaders {
    /// Creates headers for an event type and partition key.
    #[must_use]
    pub fn new(event_type: EventType, key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            key: key.into(),
            traceparent: None,
            tracestate: None,
        }
    }

    /// Attaches an opaque trace context.
    #[must_use]
    pub fn with_trace(
        mut self,
        traceparent: Option<String>,
        tracestate: Option<String>,
    ) -> Self {
        self.traceparent = traceparent;
        self.tracestate = tracestate;
        self
    }

    /// Returns the parsed event type, if recognized.
    #[must_use]
    pub fn parsed_event_type(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }
}

/// A versioned envelope wrapping a bus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// Mandatory message headers.
    pub headers: EventHeaders,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(headers: EventHeaders, payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            headers,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Returns true if this envelope uses the current version.
    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl Envelope<serde_json::Value> {
    /// Wraps a workflow event with its headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized.
    pub fn from_event(
        event: &WorkflowEvent,
        traceparent: Option<String>,
        tracestate: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        let headers = EventHeaders::new(event.event_type(), event.partition_key())
            .with_trace(traceparent, tracestate);
        Ok(Self::new(headers, event.to_payload()?))
    }

    /// Decodes the payload into the event shape named by the headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is unrecognized or the payload does
    /// not match the event shape.
    pub fn decode_event(&self) -> Result<WorkflowEvent, EnvelopeError> {
        let event_type = self
            .headers
            .parsed_event_type()
            .ok_or_else(|| EnvelopeError::UnknownEventType {
                event_type: self.headers.event_type.clone(),
            })?;
        WorkflowEvent::from_payload(event_type, self.payload.clone()).map_err(|e| {
            EnvelopeError::PayloadMismatch {
                event_type,
                message: e.to_string(),
            }
        })
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Deserializes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A versioned envelope that defers payload deserialization.
///
/// Consumers check the version and headers before committing to a payload
/// shape; an undecodable payload is a poison message, logged and acked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    /// The version of the envelope format.
    pub version: u32,
    /// Mandatory message headers.
    pub headers: EventHeaders,
    /// The raw payload (not yet deserialized).
    pub payload: serde_json::Value,
}

impl RawEnvelope {
    /// Deserializes from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Converts into a JSON-payload envelope.
    #[must_use]
    pub fn into_envelope(self) -> Envelope<serde_json::Value> {
        Envelope {
            version: self.version,
            headers: self.headers,
            payload: self.payload,
        }
    }
}

/// Errors from envelope decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The `event_type` header names no known topic.
    UnknownEventType { event_type: String },
    /// The payload does not match the event shape for its type.
    PayloadMismatch {
        event_type: EventType,
        message: String,
    },
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEventType { event_type } => {
                write!(f, "unknown event type: {event_type}")
            }
            Self::PayloadMismatch {
                event_type,
                message,
            } => {
                write!(f, "payload does not match {event_type}: {message}")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeActivation;
    use crate::node::NodeId;
    use operion_core::{ExecutionId, PublishedWorkflowId};
    use std::collections::HashMap;

    fn event() -> WorkflowEvent {
        WorkflowEvent::NodeActivation(NodeActivation::new(
            PublishedWorkflowId::new(),
            ExecutionId::new(),
            NodeId::new(),
            "in",
            HashMap::new(),
            NodeId::new(),
            "out",
        ))
    }

    #[test]
    fn envelope_carries_key_and_type() {
        let event = event();
        let envelope = Envelope::from_event(&event, None, None).expect("wrap");

        assert!(envelope.is_current_version());
        assert_eq!(envelope.headers.event_type, "node_activation");
        assert_eq!(envelope.headers.key, event.partition_key());
    }

    #[test]
    fn trace_context_propagates_opaquely() {
        let envelope = Envelope::from_event(
            &event(),
            Some("00-abc-def-01".to_string()),
            Some("vendor=1".to_string()),
        )
        .expect("wrap");

        let bytes = envelope.to_json_bytes().expect("serialize");
        let raw = RawEnvelope::from_json_bytes(&bytes).expect("raw decode");
        assert_eq!(raw.headers.traceparent.as_deref(), Some("00-abc-def-01"));
        assert_eq!(raw.headers.tracestate.as_deref(), Some("vendor=1"));
    }

    #[test]
    fn decode_event_roundtrip() {
        let event = event();
        let envelope = Envelope::from_event(&event, None, None).expect("wrap");
        let bytes = envelope.to_json_bytes().expect("serialize");

        let raw = RawEnvelope::from_json_bytes(&bytes).expect("raw decode");
        let decoded = raw.into_envelope().decode_event().expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_event_type_is_poison() {
        let mut envelope = Envelope::from_event(&event(), None, None).expect("wrap");
        envelope.headers.event_type = "node_started".to_string();

        let err = envelope.decode_event().unwrap_err();
        assert!(matches!(err, EnvelopeError::UnknownEventType { .. }));
    }

    #[test]
    fn mismatched_payload_is_poison() {
        let headers = EventHeaders::new(EventType::NodeActivation, "k");
        let envelope = Envelope::new(headers, serde_json::json!({"garbage": true}));

        let err = envelope.decode_event().unwrap_err();
        assert!(matches!(err, EnvelopeError::PayloadMismatch { .. }));
    }
}
