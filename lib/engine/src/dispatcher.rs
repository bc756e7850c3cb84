//! Initial activation of workflow executions.
//!
//! Trigger ingestion processes (scheduler, webhook receiver, message
//! consumers) observe the outside world and hand the dispatcher a trigger
//! firing. The dispatcher creates the execution context and publishes one
//! activation per outgoing connection of the trigger node; from there the
//! workers take over.

use crate::bus::{BusError, EventBus};
use crate::context::ExecutionContext;
use crate::envelope::Envelope;
use crate::event::{NodeActivation, WorkflowEvent};
use crate::node::NodeId;
use crate::repository::{
    ConnectionRepository, ExecutionContextRepository, RepositoryError, WorkflowRepository,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

use operion_core::{ExecutionId, PublishedWorkflowId};

/// A trigger firing reported by an ingestion collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFire {
    /// The snapshot to execute.
    pub published_workflow_id: PublishedWorkflowId,
    /// The trigger node that fired.
    pub trigger_node_id: NodeId,
    /// The payload that fired it.
    pub trigger_data: JsonValue,
    /// Opaque trace context from the ingestion side.
    pub traceparent: Option<String>,
    /// Opaque trace state from the ingestion side.
    pub tracestate: Option<String>,
}

impl TriggerFire {
    /// Creates a trigger firing without trace context.
    #[must_use]
    pub fn new(
        published_workflow_id: PublishedWorkflowId,
        trigger_node_id: NodeId,
        trigger_data: JsonValue,
    ) -> Self {
        Self {
            published_workflow_id,
            trigger_node_id,
            trigger_data,
            traceparent: None,
            tracestate: None,
        }
    }
}

/// Errors from dispatching a trigger firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The published workflow does not exist.
    WorkflowNotFound {
        published_workflow_id: PublishedWorkflowId,
    },
    /// The trigger node is not part of the snapshot.
    TriggerNodeNotFound { node_id: NodeId },
    /// The named node is not a trigger.
    NotATrigger { node_id: NodeId },
    /// The trigger node is disabled.
    TriggerDisabled { node_id: NodeId },
    /// Repository failure.
    Repository(RepositoryError),
    /// Bus failure.
    Bus(BusError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkflowNotFound {
                published_workflow_id,
            } => {
                write!(f, "published workflow not found: {published_workflow_id}")
            }
            Self::TriggerNodeNotFound { node_id } => {
                write!(f, "trigger node not found: {node_id}")
            }
            Self::NotATrigger { node_id } => {
                write!(f, "node {node_id} is not a trigger")
            }
            Self::TriggerDisabled { node_id } => {
                write!(f, "trigger node {node_id} is disabled")
            }
            Self::Repository(e) => write!(f, "repository error: {e}"),
            Self::Bus(e) => write!(f, "bus error: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<RepositoryError> for DispatchError {
    fn from(e: RepositoryError) -> Self {
        Self::Repository(e)
    }
}

impl From<BusError> for DispatchError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

/// Translates trigger firings into execution contexts and first activations.
pub struct Dispatcher {
    workflows: Arc<dyn WorkflowRepository>,
    connections: Arc<dyn ConnectionRepository>,
    contexts: Arc<dyn ExecutionContextRepository>,
    bus: Arc<dyn EventBus>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        connections: Arc<dyn ConnectionRepository>,
        contexts: Arc<dyn ExecutionContextRepository>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            workflows,
            connections,
            contexts,
            bus,
        }
    }

    /// Dispatches a trigger firing.
    ///
    /// Creates and persists the execution context (variables copied from the
    /// workflow), then publishes one `NodeActivation` per outgoing connection
    /// of the trigger node, keyed `"{target_node_id}:{execution_id}"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow or trigger node is invalid, or if
    /// persistence or publishing fails.
    pub async fn dispatch(&self, fire: TriggerFire) -> Result<ExecutionId, DispatchError> {
        let published_workflow_id = fire.published_workflow_id;

        let workflow = self
            .workflows
            .published_workflow(published_workflow_id)
            .await?
            .ok_or(DispatchError::WorkflowNotFound {
                published_workflow_id,
            })?;

        let trigger =
            workflow
                .node(fire.trigger_node_id)
                .ok_or(DispatchError::TriggerNodeNotFound {
                    node_id: fire.trigger_node_id,
                })?;
        if !trigger.is_trigger() {
            return Err(DispatchError::NotATrigger {
                node_id: trigger.id,
            });
        }
        if !trigger.enabled {
            return Err(DispatchError::TriggerDisabled {
                node_id: trigger.id,
            });
        }

        let context = ExecutionContext::new(
            ExecutionId::new(),
            published_workflow_id,
            fire.trigger_data.clone(),
            workflow.variables.clone(),
        );
        let execution_id = context.execution_id;
        self.contexts.update(&context).await?;

        let input_data = trigger_input_data(&fire.trigger_data);
        let connections = self
            .connections
            .connections_from_published_workflow(published_workflow_id, trigger.id)
            .await?;
        let outgoing = connections.len();

        for connection in connections {
            let activation = NodeActivation::new(
                published_workflow_id,
                execution_id,
                connection.target.node,
                connection.target.port.clone(),
                input_data.clone(),
                trigger.id,
                connection.source.port.clone(),
            );
            let envelope = Envelope::from_event(
                &WorkflowEvent::NodeActivation(activation),
                fire.traceparent.clone(),
                fire.tracestate.clone(),
            )
            .map_err(|e| {
                DispatchError::Bus(BusError::PublishFailed {
                    message: format!("failed to serialize activation: {e}"),
                })
            })?;
            self.bus.publish(envelope).await?;
        }

        tracing::info!(
            %published_workflow_id,
            %execution_id,
            trigger_node_id = %trigger.id,
            outgoing,
            "execution dispatched"
        );
        Ok(execution_id)
    }
}

/// Shapes the trigger payload for delivery to input ports.
///
/// Object payloads deliver their entries; anything else is wrapped under a
/// `data` key so ports always receive a mapping.
fn trigger_input_data(trigger_data: &JsonValue) -> HashMap<String, JsonValue> {
    match trigger_data {
        JsonValue::Object(entries) => entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        JsonValue::Null => HashMap::new(),
        other => HashMap::from([("data".to_string(), other.clone())]),
    }
}
