//! Persistence repository contracts.
//!
//! These traits are the boundary with the storage backend; any backend that
//! satisfies them is acceptable. The engine ships an in-process
//! implementation ([`crate::store::MemoryStore`]); SQL backends live out of
//! tree.
//!
//! Every operation fails with one of three kinds: `NotFound`, `Conflict`, or
//! `Transient`. Only `Transient` triggers a bus nack; the other kinds become
//! observable `NodeCompletion` events.

use crate::connection::Connection;
use crate::context::ExecutionContext;
use crate::coordinator::NodeInputState;
use crate::node::{Node, NodeId};
use crate::workflow::PublishedWorkflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use operion_core::{ExecutionId, NodeExecutionId, PublishedWorkflowId};

/// Errors from repository operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The referenced entity does not exist.
    NotFound { entity: &'static str, id: String },
    /// The write conflicts with concurrent state.
    Conflict { message: String },
    /// The backend failed transiently; the caller should nack and retry.
    Transient { message: String },
}

impl RepositoryError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Returns true if the caller should nack and rely on redelivery.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { message } => write!(f, "conflicting write: {message}"),
            Self::Transient { message } => write!(f, "transient storage failure: {message}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Read access to published workflow snapshots.
///
/// Used by the dispatcher, which needs the workflow's variables and trigger
/// node at first activation.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Returns a published workflow snapshot by ID.
    async fn published_workflow(
        &self,
        published_workflow_id: PublishedWorkflowId,
    ) -> Result<Option<PublishedWorkflow>, RepositoryError>;
}

/// Read access to node definitions within published workflows.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Returns the immutable node definition, if present.
    async fn node_from_published_workflow(
        &self,
        published_workflow_id: PublishedWorkflowId,
        node_id: NodeId,
    ) -> Result<Option<Node>, RepositoryError>;
}

/// Read access to connections within published workflows.
#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    /// Returns all connections whose source is the given node.
    ///
    /// Order is irrelevant; callers must not rely on it.
    async fn connections_from_published_workflow(
        &self,
        published_workflow_id: PublishedWorkflowId,
        source_node_id: NodeId,
    ) -> Result<Vec<Connection>, RepositoryError>;
}

/// Read/write access to execution contexts.
#[async_trait]
pub trait ExecutionContextRepository: Send + Sync {
    /// Returns the execution context, if present.
    async fn get(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionContext>, RepositoryError>;

    /// Upserts the execution context.
    ///
    /// `node_results` entries are append-only for distinct `(node_id, port)`
    /// pairs; overwriting an existing key is permitted only for an idempotent
    /// retry of the same firing or a loop iteration revisiting the node.
    async fn update(&self, context: &ExecutionContext) -> Result<(), RepositoryError>;
}

/// Read/write access to per-instance input-coordination state.
#[async_trait]
pub trait InputCoordinationRepository: Send + Sync {
    /// Returns the state for a node execution instance, if present.
    async fn load(
        &self,
        node_execution_id: NodeExecutionId,
    ) -> Result<Option<NodeInputState>, RepositoryError>;

    /// Upserts state by `node_execution_id`.
    async fn save(&self, state: &NodeInputState) -> Result<(), RepositoryError>;

    /// Deletes state after a successful firing. Deleting absent state is not
    /// an error.
    async fn delete(&self, node_execution_id: NodeExecutionId) -> Result<(), RepositoryError>;

    /// Returns the single pending instance for a `(node_id, execution_id)`
    /// pair, if any.
    async fn find_pending(
        &self,
        node_id: NodeId,
        execution_id: ExecutionId,
    ) -> Result<Option<NodeInputState>, RepositoryError>;

    /// Returns all states whose wait timeout elapsed before `now`.
    ///
    /// Supports the timeout sweeper's scan.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<NodeInputState>, RepositoryError>;
}

/// The repository handles a worker needs, grouped for wiring.
#[derive(Clone)]
pub struct EngineStores {
    /// Node definitions.
    pub nodes: std::sync::Arc<dyn NodeRepository>,
    /// Connection lookup.
    pub connections: std::sync::Arc<dyn ConnectionRepository>,
    /// Execution contexts.
    pub contexts: std::sync::Arc<dyn ExecutionContextRepository>,
    /// Input-coordination state.
    pub coordination: std::sync::Arc<dyn InputCoordinationRepository>,
}

impl EngineStores {
    /// Builds the handle set from a single in-memory store.
    #[must_use]
    pub fn from_memory(store: &std::sync::Arc<crate::store::MemoryStore>) -> Self {
        Self {
            nodes: store.clone(),
            connections: store.clone(),
            contexts: store.clone(),
            coordination: store.clone(),
        }
    }
}
