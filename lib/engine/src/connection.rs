//! Port-to-port connections between workflow nodes.
//!
//! A connection carries data from a source node's output port to a target
//! node's input port. Port identity is the pair of node ID and port name;
//! nodes may expose many ports in each direction (`success`, `error`, branch
//! labels).

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A reference to a named port on a specific node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    /// The node this port belongs to.
    pub node: NodeId,
    /// The port name.
    pub port: String,
}

impl PortRef {
    /// Creates a new port reference.
    #[must_use]
    pub fn new(node: NodeId, port: impl Into<String>) -> Self {
        Self {
            node,
            port: port.into(),
        }
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

/// A connection between an output port and an input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Unique identifier for this connection.
    pub id: String,
    /// The source output port.
    pub source: PortRef,
    /// The target input port.
    pub target: PortRef,
}

impl Connection {
    /// Creates a new connection with a generated ID.
    #[must_use]
    pub fn new(
        source_node: NodeId,
        source_port: impl Into<String>,
        target_node: NodeId,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("conn_{}", Ulid::new()),
            source: PortRef::new(source_node, source_port),
            target: PortRef::new(target_node, target_port),
        }
    }

    /// Creates a connection using default port names ("out" -> "in").
    #[must_use]
    pub fn with_default_ports(source_node: NodeId, target_node: NodeId) -> Self {
        Self::new(source_node, "out", target_node, "in")
    }
}
