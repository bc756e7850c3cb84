//! Events exchanged over the bus.
//!
//! Two event types drive the engine: `NodeActivation` (a specific input port
//! of a specific node in a specific execution has received data) and
//! `NodeCompletion` (a node firing finished, for observability and
//! termination tracking). Both are keyed `"{node_id}:{execution_id}"` so all
//! re-entrant activations of one node within one execution land on the same
//! partition.

use crate::context::NodeResultStatus;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use operion_core::{EventId, ExecutionId, PublishedWorkflowId};

/// The typed topics carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A node input port received data.
    NodeActivation,
    /// A node firing finished.
    NodeCompletion,
}

impl EventType {
    /// Returns the topic name, also used as a subject token.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeActivation => "node_activation",
            Self::NodeCompletion => "node_completion",
        }
    }

    /// Parses a topic name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "node_activation" => Some(Self::NodeActivation),
            "node_completion" => Some(Self::NodeCompletion),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message instructing a worker that an input port received data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeActivation {
    /// Unique identifier for this event.
    pub event_id: EventId,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// The snapshot being executed.
    pub published_workflow_id: PublishedWorkflowId,
    /// The execution this activation belongs to.
    pub execution_id: ExecutionId,
    /// The node being activated.
    pub node_id: NodeId,
    /// The input port receiving data.
    pub input_port: String,
    /// The data delivered to the port.
    pub input_data: HashMap<String, JsonValue>,
    /// The node that produced the data.
    pub source_node: NodeId,
    /// The output port the data left through.
    pub source_port: String,
}

impl NodeActivation {
    /// Creates a new activation event stamped now.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        published_workflow_id: PublishedWorkflowId,
        execution_id: ExecutionId,
        node_id: NodeId,
        input_port: impl Into<String>,
        input_data: HashMap<String, JsonValue>,
        source_node: NodeId,
        source_port: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            published_workflow_id,
            execution_id,
            node_id,
            input_port: input_port.into(),
            input_data,
            source_node,
            source_port: source_port.into(),
        }
    }

    /// Returns the partition key for this activation.
    #[must_use]
    pub fn partition_key(&self) -> String {
        partition_key(self.node_id, self.execution_id)
    }
}

/// A record that a node firing finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCompletion {
    /// Unique identifier for this event.
    pub event_id: EventId,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// The snapshot being executed.
    pub published_workflow_id: PublishedWorkflowId,
    /// The execution this completion belongs to.
    pub execution_id: ExecutionId,
    /// The node that fired.
    pub node_id: NodeId,
    /// Outcome of the firing.
    pub status: NodeResultStatus,
    /// Produced data by output port.
    pub output_data: HashMap<String, HashMap<String, JsonValue>>,
    /// Error message when `status` is `Error`.
    pub error_message: Option<String>,
    /// When the firing finished.
    pub completed_at: DateTime<Utc>,
}

impl NodeCompletion {
    /// Creates a completion event stamped now.
    #[must_use]
    pub fn new(
        published_workflow_id: PublishedWorkflowId,
        execution_id: ExecutionId,
        node_id: NodeId,
        status: NodeResultStatus,
        output_data: HashMap<String, HashMap<String, JsonValue>>,
        error_message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_id: EventId::new(),
            timestamp: now,
            published_workflow_id,
            execution_id,
            node_id,
            status,
            output_data,
            error_message,
            completed_at: now,
        }
    }

    /// Returns the partition key for this completion.
    #[must_use]
    pub fn partition_key(&self) -> String {
        partition_key(self.node_id, self.execution_id)
    }
}

/// Returns the bus partition key for a node within an execution.
#[must_use]
pub fn partition_key(node_id: NodeId, execution_id: ExecutionId) -> String {
    format!("{node_id}:{execution_id}")
}

/// A decoded bus event.
///
/// The bus adapter decodes payloads into this shape, directed by the
/// `event_type` header, before invoking the registered handler.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// A node activation.
    NodeActivation(NodeActivation),
    /// A node completion.
    NodeCompletion(NodeCompletion),
}

impl WorkflowEvent {
    /// Returns the event type of this event.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::NodeActivation(_) => EventType::NodeActivation,
            Self::NodeCompletion(_) => EventType::NodeCompletion,
        }
    }

    /// Returns the partition key of this event.
    #[must_use]
    pub fn partition_key(&self) -> String {
        match self {
            Self::NodeActivation(activation) => activation.partition_key(),
            Self::NodeCompletion(completion) => completion.partition_key(),
        }
    }

    /// Returns the execution this event belongs to.
    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Self::NodeActivation(activation) => activation.execution_id,
            Self::NodeCompletion(completion) => completion.execution_id,
        }
    }

    /// Serializes the inner event shape to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            Self::NodeActivation(activation) => serde_json::to_value(activation),
            Self::NodeCompletion(completion) => serde_json::to_value(completion),
        }
    }

    /// Decodes an event payload, directed by the event type.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the event shape.
    pub fn from_payload(
        event_type: EventType,
        payload: JsonValue,
    ) -> Result<Self, serde_json::Error> {
        match event_type {
            EventType::NodeActivation => serde_json::from_value(payload).map(Self::NodeActivation),
            EventType::NodeCompletion => serde_json::from_value(payload).map(Self::NodeCompletion),
        }
    }
}

impl From<NodeActivation> for WorkflowEvent {
    fn from(activation: NodeActivation) -> Self {
        Self::NodeActivation(activation)
    }
}

impl From<NodeCompletion> for WorkflowEvent {
    fn from(completion: NodeCompletion) -> Self {
        Self::NodeCompletion(completion)
    }
}
