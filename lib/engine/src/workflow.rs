//! Published workflow snapshots.
//!
//! A published workflow is the immutable snapshot produced when a draft is
//! published. Workers and dispatchers only ever read published snapshots;
//! authoring-time drafts live behind the REST API and never reach the
//! execution engine.
//!
//! Cycles are expressed purely in connection data and are allowed — loops
//! are an expected workflow shape. Structural validation therefore checks
//! endpoint existence and duplicate edges, never acyclicity.

use crate::connection::{Connection, PortRef};
use crate::node::{Node, NodeId};
use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

use operion_core::PublishedWorkflowId;

/// Errors from snapshot graph operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A connection references a source node that is not in the snapshot.
    SourceNodeMissing { connection_id: String, node_id: NodeId },
    /// A connection references a target node that is not in the snapshot.
    TargetNodeMissing { connection_id: String, node_id: NodeId },
    /// Two connections share the same (source port, target port) pair.
    DuplicateConnection { source: PortRef, target: PortRef },
    /// Two connections share the same connection ID.
    DuplicateConnectionId { connection_id: String },
    /// A node ID appears twice in the snapshot.
    DuplicateNode { node_id: NodeId },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceNodeMissing {
                connection_id,
                node_id,
            } => {
                write!(
                    f,
                    "connection {connection_id} references missing source node {node_id}"
                )
            }
            Self::TargetNodeMissing {
                connection_id,
                node_id,
            } => {
                write!(
                    f,
                    "connection {connection_id} references missing target node {node_id}"
                )
            }
            Self::DuplicateConnection { source, target } => {
                write!(f, "duplicate connection {source} -> {target}")
            }
            Self::DuplicateConnectionId { connection_id } => {
                write!(f, "duplicate connection id: {connection_id}")
            }
            Self::DuplicateNode { node_id } => {
                write!(f, "duplicate node: {node_id}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// An immutable published workflow snapshot.
///
/// All workers share the same read-only view of a snapshot; mutation happens
/// only through the authoring side publishing a new snapshot under a new ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedWorkflow {
    /// Unique identifier for this snapshot.
    pub id: PublishedWorkflowId,
    /// Human-readable name of the workflow.
    pub name: String,
    /// Version label carried over from the draft at publish time.
    pub version: String,
    /// Workflow variables, copied into every execution context at dispatch.
    pub variables: HashMap<String, JsonValue>,
    /// Nodes by ID.
    pub nodes: HashMap<NodeId, Node>,
    /// Port-to-port connections.
    pub connections: Vec<Connection>,
    /// When this snapshot was published.
    pub published_at: DateTime<Utc>,
    /// Opaque metadata.
    pub metadata: HashMap<String, JsonValue>,
}

impl PublishedWorkflow {
    /// Creates a new empty snapshot with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PublishedWorkflowId::new(),
            name: name.into(),
            version: "1".to_string(),
            variables: HashMap::new(),
            nodes: HashMap::new(),
            connections: Vec::new(),
            published_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Returns this snapshot with a specific ID.
    #[must_use]
    pub fn with_id(mut self, id: PublishedWorkflowId) -> Self {
        self.id = id;
        self
    }

    /// Sets a workflow variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Adds a node to the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a node with the same ID already exists.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        let node_id = node.id;
        if self.nodes.contains_key(&node_id) {
            return Err(GraphError::DuplicateNode { node_id });
        }
        self.nodes.insert(node_id, node);
        Ok(node_id)
    }

    /// Adds a connection to the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint node is missing or the same
    /// (source port, target port) pair is already connected.
    pub fn add_connection(&mut self, connection: Connection) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&connection.source.node) {
            return Err(GraphError::SourceNodeMissing {
                connection_id: connection.id.clone(),
                node_id: connection.source.node,
            });
        }
        if !self.nodes.contains_key(&connection.target.node) {
            return Err(GraphError::TargetNodeMissing {
                connection_id: connection.id.clone(),
                node_id: connection.target.node,
            });
        }
        if self
            .connections
            .iter()
            .any(|c| c.source == connection.source && c.target == connection.target)
        {
            return Err(GraphError::DuplicateConnection {
                source: connection.source,
                target: connection.target,
            });
        }
        self.connections.push(connection);
        Ok(())
    }

    /// Returns a node by ID.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Returns all connections whose source is the given node.
    ///
    /// Order is irrelevant to the engine; callers must not rely on it.
    #[must_use]
    pub fn connections_from(&self, source: NodeId) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.source.node == source)
            .collect()
    }

    /// Returns all trigger nodes in this snapshot.
    #[must_use]
    pub fn trigger_nodes(&self) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.is_trigger()).collect()
    }

    /// Validates the structural invariants of a deserialized snapshot.
    ///
    /// `add_node`/`add_connection` enforce these incrementally; this re-checks
    /// the whole set for snapshots that arrived over the wire or from storage.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut ids = HashSet::new();
        let mut pairs = HashSet::new();
        for connection in &self.connections {
            if !self.nodes.contains_key(&connection.source.node) {
                return Err(GraphError::SourceNodeMissing {
                    connection_id: connection.id.clone(),
                    node_id: connection.source.node,
                });
            }
            if !self.nodes.contains_key(&connection.target.node) {
                return Err(GraphError::TargetNodeMissing {
                    connection_id: connection.id.clone(),
                    node_id: connection.target.node,
                });
            }
            if !ids.insert(connection.id.as_str()) {
                return Err(GraphError::DuplicateConnectionId {
                    connection_id: connection.id.clone(),
                });
            }
            if !pairs.insert((&connection.source, &connection.target)) {
                return Err(GraphError::DuplicateConnection {
                    source: connection.source.clone(),
                    target: connection.target.clone(),
                });
            }
        }
        Ok(())
    }

    /// Returns true if the connection graph contains a cycle.
    ///
    /// Cycles are allowed; this is a diagnostic for authoring tools.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        let (graph, _) = self.as_petgraph();
        is_cyclic_directed(&graph)
    }

    /// Returns nodes unreachable from any trigger node.
    ///
    /// Unreachable nodes never execute; authoring tools surface them as
    /// warnings at publish time.
    #[must_use]
    pub fn unreachable_from_triggers(&self) -> Vec<NodeId> {
        let (graph, index_map) = self.as_petgraph();

        let mut reached: HashSet<NodeId> = HashSet::new();
        for trigger in self.trigger_nodes() {
            let Some(&start) = index_map.get(&trigger.id) else {
                continue;
            };
            let mut bfs = Bfs::new(&graph, start);
            while let Some(idx) = bfs.next(&graph) {
                reached.insert(graph[idx]);
            }
        }

        self.nodes
            .keys()
            .copied()
            .filter(|id| !reached.contains(id))
            .collect()
    }

    /// Builds a petgraph view of the connection structure.
    fn as_petgraph(&self) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();

        for node_id in self.nodes.keys() {
            let idx = graph.add_node(*node_id);
            index_map.insert(*node_id, idx);
        }
        for connection in &self.connections {
            if let (Some(&source), Some(&target)) = (
                index_map.get(&connection.source.node),
                index_map.get(&connection.target.node),
            ) {
                graph.add_edge(source, target, ());
            }
        }

        (graph, index_map)
    }
}
