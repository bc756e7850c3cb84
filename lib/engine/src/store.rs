//! In-process store implementing every repository contract.
//!
//! Backs tests and the `memory://` database provider of the worker binary.
//! Production deployments satisfy the repository traits with an external
//! backend; the engine never depends on more than the traits.

use crate::connection::Connection;
use crate::context::ExecutionContext;
use crate::coordinator::NodeInputState;
use crate::node::{Node, NodeId};
use crate::repository::{
    ConnectionRepository, ExecutionContextRepository, InputCoordinationRepository, NodeRepository,
    RepositoryError, WorkflowRepository,
};
use crate::workflow::PublishedWorkflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use operion_core::{ExecutionId, NodeExecutionId, PublishedWorkflowId};

/// In-memory store for published workflows, execution contexts, and
/// input-coordination state.
#[derive(Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<PublishedWorkflowId, PublishedWorkflow>>,
    contexts: RwLock<HashMap<ExecutionId, ExecutionContext>>,
    coordination: RwLock<HashMap<NodeExecutionId, NodeInputState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a published workflow snapshot.
    ///
    /// Publishing is an authoring-side concern; this is the seam through
    /// which tests and single-process deployments make snapshots visible to
    /// the engine.
    pub async fn insert_workflow(&self, workflow: PublishedWorkflow) {
        self.workflows.write().await.insert(workflow.id, workflow);
    }

    /// Returns the number of pending coordination states, for inspection.
    pub async fn coordination_state_count(&self) -> usize {
        self.coordination.read().await.len()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn published_workflow(
        &self,
        published_workflow_id: PublishedWorkflowId,
    ) -> Result<Option<PublishedWorkflow>, RepositoryError> {
        Ok(self
            .workflows
            .read()
            .await
            .get(&published_workflow_id)
            .cloned())
    }
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn node_from_published_workflow(
        &self,
        published_workflow_id: PublishedWorkflowId,
        node_id: NodeId,
    ) -> Result<Option<Node>, RepositoryError> {
        Ok(self
            .workflows
            .read()
            .await
            .get(&published_workflow_id)
            .and_then(|workflow| workflow.node(node_id))
            .cloned())
    }
}

#[async_trait]
impl ConnectionRepository for MemoryStore {
    async fn connections_from_published_workflow(
        &self,
        published_workflow_id: PublishedWorkflowId,
        source_node_id: NodeId,
    ) -> Result<Vec<Connection>, RepositoryError> {
        Ok(self
            .workflows
            .read()
            .await
            .get(&published_workflow_id)
            .map(|workflow| {
                workflow
                    .connections_from(source_node_id)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExecutionContextRepository for MemoryStore {
    async fn get(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionContext>, RepositoryError> {
        Ok(self.contexts.read().await.get(&execution_id).cloned())
    }

    async fn update(&self, context: &ExecutionContext) -> Result<(), RepositoryError> {
        self.contexts
            .write()
            .await
            .insert(context.execution_id, context.clone());
        Ok(())
    }
}

#[async_trait]
impl InputCoordinationRepository for MemoryStore {
    async fn load(
        &self,
        node_execution_id: NodeExecutionId,
    ) -> Result<Option<NodeInputState>, RepositoryError> {
        Ok(self
            .coordination
            .read()
            .await
            .get(&node_execution_id)
            .cloned())
    }

    async fn save(&self, state: &NodeInputState) -> Result<(), RepositoryError> {
        self.coordination
            .write()
            .await
            .insert(state.node_execution_id, state.clone());
        Ok(())
    }

    async fn delete(&self, node_execution_id: NodeExecutionId) -> Result<(), RepositoryError> {
        self.coordination.write().await.remove(&node_execution_id);
        Ok(())
    }

    async fn find_pending(
        &self,
        node_id: NodeId,
        execution_id: ExecutionId,
    ) -> Result<Option<NodeInputState>, RepositoryError> {
        // A state exists exactly while its instance is pending; the earliest
        // wins if duplicates ever survive a partition rebalance.
        Ok(self
            .coordination
            .read()
            .await
            .values()
            .filter(|state| state.node_id == node_id && state.execution_id == execution_id)
            .min_by_key(|state| state.created_at)
            .cloned())
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<NodeInputState>, RepositoryError> {
        Ok(self
            .coordination
            .read()
            .await
            .values()
            .filter(|state| state.is_expired(now))
            .cloned()
            .collect())
    }
}
