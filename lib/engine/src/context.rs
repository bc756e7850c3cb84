//! Execution context and node results.
//!
//! The execution context is the mutable per-run record. It is created by the
//! dispatcher at first activation, updated by workers after each successful
//! node execution, and carries the authoritative `node_results` mapping keyed
//! `"{node_id}::{port}"`.

use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use operion_core::{ExecutionId, PublishedWorkflowId};

/// The overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Execution is in progress.
    Running,
    /// Execution finished with all terminal nodes completed.
    Succeeded,
    /// Execution failed.
    Failed,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// The status of a single node result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeResultStatus {
    /// The node produced this output normally.
    Success,
    /// The node reported an error on this output.
    Error,
    /// The node was skipped (disabled, branch not taken).
    Skipped,
}

/// Data produced on one output port by one node firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// The node that produced this result.
    pub producer_node_id: NodeId,
    /// The produced data.
    pub data: HashMap<String, JsonValue>,
    /// Result status.
    pub status: NodeResultStatus,
    /// When the result was produced.
    pub timestamp: DateTime<Utc>,
    /// Error message when `status` is `Error`.
    pub error_message: Option<String>,
}

impl NodeResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(producer_node_id: NodeId, data: HashMap<String, JsonValue>) -> Self {
        Self {
            producer_node_id,
            data,
            status: NodeResultStatus::Success,
            timestamp: Utc::now(),
            error_message: None,
        }
    }

    /// Creates an error result.
    #[must_use]
    pub fn error(producer_node_id: NodeId, message: impl Into<String>) -> Self {
        Self {
            producer_node_id,
            data: HashMap::new(),
            status: NodeResultStatus::Error,
            timestamp: Utc::now(),
            error_message: Some(message.into()),
        }
    }

    /// Creates a skipped result.
    #[must_use]
    pub fn skipped(producer_node_id: NodeId) -> Self {
        Self {
            producer_node_id,
            data: HashMap::new(),
            status: NodeResultStatus::Skipped,
            timestamp: Utc::now(),
            error_message: None,
        }
    }

    /// Returns true if this result carries an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == NodeResultStatus::Error
    }
}

/// Mutable per-run execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique identifier for this execution.
    pub execution_id: ExecutionId,
    /// The snapshot being executed.
    pub published_workflow_id: PublishedWorkflowId,
    /// Overall execution status.
    pub status: ExecutionStatus,
    /// The payload that started this run.
    pub trigger_data: JsonValue,
    /// Variables copied from the workflow at dispatch, readable by nodes.
    pub variables: HashMap<String, JsonValue>,
    /// Produced outputs keyed `"{node_id}::{port}"`.
    ///
    /// Entries are append-only for distinct keys; overwriting an existing
    /// key is permitted only for idempotent retries of the same firing and
    /// for loop iterations revisiting the same node.
    pub node_results: HashMap<String, NodeResult>,
    /// Opaque metadata.
    pub metadata: HashMap<String, JsonValue>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the context was last updated.
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Creates a new running execution context.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        published_workflow_id: PublishedWorkflowId,
        trigger_data: JsonValue,
        variables: HashMap<String, JsonValue>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            published_workflow_id,
            status: ExecutionStatus::Running,
            trigger_data,
            variables,
            node_results: HashMap::new(),
            metadata: HashMap::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Returns the `node_results` key for a node's output port.
    #[must_use]
    pub fn result_key(node_id: NodeId, port: &str) -> String {
        format!("{node_id}::{port}")
    }

    /// Records a node result under its `"{node_id}::{port}"` key.
    pub fn record_result(&mut self, node_id: NodeId, port: &str, result: NodeResult) {
        self.node_results
            .insert(Self::result_key(node_id, port), result);
        self.updated_at = Utc::now();
    }

    /// Returns the result produced on a node's output port, if any.
    #[must_use]
    pub fn result_for(&self, node_id: NodeId, port: &str) -> Option<&NodeResult> {
        self.node_results.get(&Self::result_key(node_id, port))
    }

    /// Marks the execution as failed.
    pub fn fail(&mut self) {
        self.status = ExecutionStatus::Failed;
        self.updated_at = Utc::now();
    }

    /// Marks the execution as succeeded.
    ///
    /// Called by a terminator collaborator observing completion events, not
    /// by workers.
    pub fn succeed(&mut self) {
        self.status = ExecutionStatus::Succeeded;
        self.updated_at = Utc::now();
    }
}
