//! Input coordination across workers.
//!
//! The coordinator turns a stream of potentially out-of-order, potentially
//! duplicated per-port activations into a single firing of the node once its
//! requirements are met, and does so correctly when a loop revisits the same
//! node.
//!
//! There is no long-lived node actor in memory; waiting is expressed as
//! durable state plus key-based message ordering. For any `(node_id,
//! execution_id)` pair at most one pending instance exists at a time:
//! activations arriving before the current instance fires merge into it, and
//! once the instance fires and its state is deleted, the next activation
//! mints a fresh `node_execution_id`. Combined with partition-key FIFO this
//! makes loop iterations unable to overtake each other.

use crate::context::NodeResult;
use crate::node::NodeId;
use crate::repository::{InputCoordinationRepository, RepositoryError};
use crate::requirements::InputRequirements;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use operion_core::{ExecutionId, NodeExecutionId};

/// Durable per-instance coordination record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInputState {
    /// The node awaiting inputs.
    pub node_id: NodeId,
    /// The execution this instance belongs to.
    pub execution_id: ExecutionId,
    /// The instance identifier; fresh per firing.
    pub node_execution_id: NodeExecutionId,
    /// Inputs received so far, by port.
    pub received_inputs: HashMap<String, NodeResult>,
    /// Requirements copied from the node type at creation.
    pub requirements: InputRequirements,
    /// When this instance was created.
    pub created_at: DateTime<Utc>,
    /// When an input last arrived.
    pub last_updated_at: DateTime<Utc>,
}

impl NodeInputState {
    /// Creates a fresh instance with no inputs.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        execution_id: ExecutionId,
        node_execution_id: NodeExecutionId,
        requirements: InputRequirements,
    ) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            execution_id,
            node_execution_id,
            received_inputs: HashMap::new(),
            requirements,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Returns true if the received inputs satisfy the requirements.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.requirements.is_satisfied_by(&self.received_inputs)
    }

    /// Returns true if this instance's wait timeout elapsed before `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.requirements
            .timeout_ms
            .is_some_and(|timeout_ms| {
                self.created_at + Duration::milliseconds(timeout_ms as i64) < now
            })
    }
}

/// Coordinates input gathering against the durable state store.
#[derive(Clone)]
pub struct InputCoordinator {
    repository: Arc<dyn InputCoordinationRepository>,
}

impl InputCoordinator {
    /// Creates a coordinator over the given repository.
    #[must_use]
    pub fn new(repository: Arc<dyn InputCoordinationRepository>) -> Self {
        Self { repository }
    }

    /// Contributes one arriving port to an instance and reports readiness.
    ///
    /// The state is created with the provided requirements if absent. Inputs
    /// for ports outside the declared set are stored but never contribute to
    /// readiness, which makes duplicate and stray activations idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn add_input(
        &self,
        node_id: NodeId,
        execution_id: ExecutionId,
        node_execution_id: NodeExecutionId,
        port: &str,
        result: NodeResult,
        requirements: &InputRequirements,
    ) -> Result<(NodeInputState, bool), RepositoryError> {
        let mut state = match self.repository.load(node_execution_id).await? {
            Some(state) => state,
            None => NodeInputState::new(
                node_id,
                execution_id,
                node_execution_id,
                requirements.clone(),
            ),
        };

        state.received_inputs.insert(port.to_string(), result);
        state.last_updated_at = Utc::now();
        self.repository.save(&state).await?;

        let ready = state.is_ready();
        Ok((state, ready))
    }

    /// Returns the unique pending instance for a `(node_id, execution_id)`
    /// pair, if any.
    ///
    /// The worker uses this to decide whether to merge a new activation into
    /// the pending instance or mint a fresh `node_execution_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn pending_node_execution(
        &self,
        node_id: NodeId,
        execution_id: ExecutionId,
    ) -> Result<Option<NodeInputState>, RepositoryError> {
        self.repository.find_pending(node_id, execution_id).await
    }

    /// Deletes the state after a successful firing.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails. Deleting an already-deleted
    /// instance is not an error.
    pub async fn cleanup_node_execution(
        &self,
        node_execution_id: NodeExecutionId,
    ) -> Result<(), RepositoryError> {
        self.repository.delete(node_execution_id).await
    }

    /// Returns all instances whose wait timeout elapsed before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<NodeInputState>, RepositoryError> {
        self.repository.expired(now).await
    }
}
