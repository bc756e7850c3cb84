//! Workflow node records.
//!
//! Nodes are the vertices of a published workflow graph. Each node has:
//! - A unique ID within the workflow
//! - A type string resolved against the node registry at execution time
//! - A free-form configuration mapping validated by the node's factory
//! - A category (trigger or action)

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use ulid::Ulid;

/// A unique identifier for a node within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Ulid);

impl NodeId {
    /// Creates a new random node ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Creates a node ID from a ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// The category of a workflow node.
///
/// Triggers are entry points activated by external collaborators (schedules,
/// webhooks, message consumers); actions are executed by workers in response
/// to activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Entry points that initiate workflow execution.
    Trigger,
    /// Nodes executed by workers when their inputs are ready.
    Action,
}

/// A workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node within the workflow.
    pub id: NodeId,
    /// Human-readable name for this node.
    pub name: String,
    /// The node type, resolved against the registry at execution time.
    pub node_type: String,
    /// Free-form configuration validated by the node factory.
    pub config: JsonValue,
    /// Whether this node participates in execution. Activations for
    /// disabled nodes complete as skipped.
    pub enabled: bool,
    /// Node category.
    pub category: NodeCategory,
}

impl Node {
    /// Creates a new enabled action node.
    #[must_use]
    pub fn action(name: impl Into<String>, node_type: impl Into<String>, config: JsonValue) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            node_type: node_type.into(),
            config,
            enabled: true,
            category: NodeCategory::Action,
        }
    }

    /// Creates a new enabled trigger node.
    #[must_use]
    pub fn trigger(
        name: impl Into<String>,
        node_type: impl Into<String>,
        config: JsonValue,
    ) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            node_type: node_type.into(),
            config,
            enabled: true,
            category: NodeCategory::Trigger,
        }
    }

    /// Returns this node with a specific ID.
    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Returns this node with enablement toggled.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns true if this node is a trigger.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.category == NodeCategory::Trigger
    }
}
