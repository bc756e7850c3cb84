//! The worker: consumes activations, executes nodes, fans out.
//!
//! For each delivered `NodeActivation` the worker loads the node definition,
//! gathers the arriving input into the coordination state, and fires the node
//! once its requirements are met. Step ordering is load-bearing: outputs are
//! persisted before coordination cleanup, and cleanup happens before fan-out,
//! so a crash at any point is recoverable — redelivered activations find
//! stored outputs and are deduplicated by the coordinator or produce an
//! identical firing.
//!
//! A node instance's lifetime is one handler invocation per readiness; there
//! is no long-lived node actor in memory.

use crate::bus::{EventBus, EventHandler, HandlerError};
use crate::context::{NodeResult, NodeResultStatus};
use crate::coordinator::{InputCoordinator, NodeInputState};
use crate::envelope::{Envelope, EventHeaders};
use crate::event::{NodeActivation, NodeCompletion, WorkflowEvent};
use crate::node::Node;
use crate::registry::{NodeHandler, NodeRegistry};
use crate::repository::{
    ConnectionRepository, EngineStores, ExecutionContextRepository, NodeRepository,
    RepositoryError,
};
use crate::requirements::WaitMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use operion_core::{ExecutionId, PublishedWorkflowId, WorkerId};

/// Operational settings for a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Deadline for a single node execution.
    pub node_timeout: Duration,
    /// Interval between timeout sweeps.
    pub sweep_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Opaque trace context propagated from incoming to outgoing events.
#[derive(Debug, Clone, Default)]
struct Trace {
    parent: Option<String>,
    state: Option<String>,
}

impl Trace {
    fn from_headers(headers: &EventHeaders) -> Self {
        Self {
            parent: headers.traceparent.clone(),
            state: headers.tracestate.clone(),
        }
    }
}

/// The worker manager: the engine's activation handler.
pub struct WorkerManager {
    worker_id: WorkerId,
    settings: WorkerSettings,
    registry: Arc<NodeRegistry>,
    bus: Arc<dyn EventBus>,
    coordinator: InputCoordinator,
    nodes: Arc<dyn NodeRepository>,
    connections: Arc<dyn ConnectionRepository>,
    contexts: Arc<dyn ExecutionContextRepository>,
}

impl WorkerManager {
    /// Creates a worker manager.
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        settings: WorkerSettings,
        registry: Arc<NodeRegistry>,
        bus: Arc<dyn EventBus>,
        stores: EngineStores,
    ) -> Self {
        Self {
            worker_id,
            settings,
            registry,
            bus,
            coordinator: InputCoordinator::new(stores.coordination),
            nodes: stores.nodes,
            connections: stores.connections,
            contexts: stores.contexts,
        }
    }

    /// Returns this worker's ID.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Handles one delivered activation.
    async fn handle_activation(
        &self,
        activation: NodeActivation,
        trace: Trace,
    ) -> Result<(), HandlerError> {
        let published_workflow_id = activation.published_workflow_id;
        let execution_id = activation.execution_id;

        // 1. Load the node definition.
        let node = self
            .nodes
            .node_from_published_workflow(published_workflow_id, activation.node_id)
            .await
            .map_err(repo_to_handler)?;
        let Some(node) = node else {
            tracing::warn!(node_id = %activation.node_id, %execution_id, "activated node not in snapshot");
            self.emit_completion(
                published_workflow_id,
                execution_id,
                activation.node_id,
                NodeResultStatus::Error,
                HashMap::new(),
                Some(format!("node {} not found in snapshot", activation.node_id)),
                &trace,
            )
            .await?;
            return Ok(());
        };
        if !node.enabled {
            tracing::debug!(node_id = %node.id, %execution_id, "skipping disabled node");
            self.emit_completion(
                published_workflow_id,
                execution_id,
                node.id,
                NodeResultStatus::Skipped,
                HashMap::new(),
                None,
                &trace,
            )
            .await?;
            return Ok(());
        }

        // 2. Instantiate the node; its declared requirements gate readiness.
        let handler = match self
            .registry
            .create_node(&node.node_type, node.id, &node.config)
        {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!(node_id = %node.id, error = %e, "node creation rejected");
                self.emit_completion(
                    published_workflow_id,
                    execution_id,
                    node.id,
                    NodeResultStatus::Error,
                    HashMap::new(),
                    Some(e.to_string()),
                    &trace,
                )
                .await?;
                return Ok(());
            }
        };
        let requirements = NodeRegistry::requirements_of(handler.as_ref());

        // 3. Merge into the pending instance or mint a fresh one.
        let node_execution_id = match self
            .coordinator
            .pending_node_execution(node.id, execution_id)
            .await
            .map_err(repo_to_handler)?
        {
            Some(pending) => pending.node_execution_id,
            None => operion_core::NodeExecutionId::new(),
        };

        // 4. Contribute the arriving port.
        let contribution = NodeResult::success(activation.source_node, activation.input_data);
        let (state, ready) = self
            .coordinator
            .add_input(
                node.id,
                execution_id,
                node_execution_id,
                &activation.input_port,
                contribution,
                &requirements,
            )
            .await
            .map_err(repo_to_handler)?;
        if !ready {
            tracing::debug!(
                node_id = %node.id,
                %execution_id,
                %node_execution_id,
                port = %activation.input_port,
                "input stored, instance not ready"
            );
            return Ok(());
        }

        self.fire(published_workflow_id, &node, handler.as_ref(), state, &trace)
            .await
    }

    /// Steps 5–11: execute a ready instance and fan out.
    async fn fire(
        &self,
        published_workflow_id: PublishedWorkflowId,
        node: &Node,
        handler: &dyn NodeHandler,
        state: NodeInputState,
        trace: &Trace,
    ) -> Result<(), HandlerError> {
        let execution_id = state.execution_id;

        // 5. Load the execution context.
        let context = self
            .contexts
            .get(execution_id)
            .await
            .map_err(repo_to_handler)?;
        let Some(mut context) = context else {
            tracing::warn!(%execution_id, node_id = %node.id, "execution context not found");
            self.emit_completion(
                published_workflow_id,
                execution_id,
                node.id,
                NodeResultStatus::Error,
                HashMap::new(),
                Some(format!("execution context not found: {execution_id}")),
                trace,
            )
            .await?;
            return Ok(());
        };

        // 6. Execute under the worker deadline. A thrown error keeps the
        // coordination state so bus redelivery can retry the firing.
        let execution = tokio::time::timeout(
            self.settings.node_timeout,
            handler.execute(&context, &state.received_inputs),
        )
        .await;
        let outputs = match execution {
            Ok(Ok(outputs)) => outputs,
            Ok(Err(e)) => {
                tracing::warn!(node_id = %node.id, %execution_id, error = %e, "node execution failed");
                self.emit_completion(
                    published_workflow_id,
                    execution_id,
                    node.id,
                    NodeResultStatus::Error,
                    HashMap::new(),
                    Some(e.to_string()),
                    trace,
                )
                .await?;
                return Err(HandlerError::retryable(format!(
                    "node {} execution failed: {e}",
                    node.id
                )));
            }
            Err(_) => {
                tracing::warn!(node_id = %node.id, %execution_id, "node execution exceeded deadline");
                self.emit_completion(
                    published_workflow_id,
                    execution_id,
                    node.id,
                    NodeResultStatus::Error,
                    HashMap::new(),
                    Some("execution timed out".to_string()),
                    trace,
                )
                .await?;
                return Err(HandlerError::retryable(format!(
                    "node {} exceeded the execution deadline",
                    node.id
                )));
            }
        };

        // 7. Persist outputs before anything else becomes visible.
        for (port, result) in &outputs {
            context.record_result(node.id, port, result.clone());
        }
        self.contexts
            .update(&context)
            .await
            .map_err(repo_to_handler)?;

        // 8. Release the coordination state before fan-out so a redelivered
        // activation mints a fresh instance instead of refiring this one.
        self.coordinator
            .cleanup_node_execution(state.node_execution_id)
            .await
            .map_err(repo_to_handler)?;

        // 9. Fan out to connected successors; unconnected output ports are
        // silently dropped.
        let connections = self
            .connections
            .connections_from_published_workflow(published_workflow_id, node.id)
            .await
            .map_err(repo_to_handler)?;
        for connection in connections {
            let Some(result) = outputs.get(&connection.source.port) else {
                continue;
            };
            let downstream = NodeActivation::new(
                published_workflow_id,
                execution_id,
                connection.target.node,
                connection.target.port.clone(),
                result.data.clone(),
                node.id,
                connection.source.port.clone(),
            );
            self.publish(WorkflowEvent::NodeActivation(downstream), trace)
                .await?;
        }

        // 10. Completion for observability and termination tracking.
        let status = if outputs.values().any(NodeResult::is_error) {
            NodeResultStatus::Error
        } else {
            NodeResultStatus::Success
        };
        let error_message = outputs.values().find_map(|r| r.error_message.clone());
        let output_data = outputs
            .iter()
            .map(|(port, result)| (port.clone(), result.data.clone()))
            .collect();
        self.emit_completion(
            published_workflow_id,
            execution_id,
            node.id,
            status,
            output_data,
            error_message,
            trace,
        )
        .await?;

        tracing::info!(
            worker_id = %self.worker_id,
            node_id = %node.id,
            %execution_id,
            node_execution_id = %state.node_execution_id,
            "node fired"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_completion(
        &self,
        published_workflow_id: PublishedWorkflowId,
        execution_id: ExecutionId,
        node_id: crate::node::NodeId,
        status: NodeResultStatus,
        output_data: HashMap<String, HashMap<String, serde_json::Value>>,
        error_message: Option<String>,
        trace: &Trace,
    ) -> Result<(), HandlerError> {
        let completion = NodeCompletion::new(
            published_workflow_id,
            execution_id,
            node_id,
            status,
            output_data,
            error_message,
        );
        self.publish(WorkflowEvent::NodeCompletion(completion), trace)
            .await
    }

    async fn publish(&self, event: WorkflowEvent, trace: &Trace) -> Result<(), HandlerError> {
        let envelope = Envelope::from_event(&event, trace.parent.clone(), trace.state.clone())
            .map_err(|e| HandlerError::fatal(format!("failed to serialize event: {e}")))?;
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| HandlerError::retryable(format!("publish failed: {e}")))
    }

    /// Runs the timeout sweeper until shutdown.
    ///
    /// Placement is per worker process; duplicate sweeps across workers are
    /// idempotent under the partition-key discipline.
    pub async fn run_timeout_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_expired(Utc::now()).await {
                        tracing::warn!(error = %e, "timeout sweep failed");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Sweeps instances whose wait timeout elapsed before `now`.
    ///
    /// Instances whose wait mode tolerates the inputs received so far fire
    /// with what they have; the rest complete with an `input timeout` error
    /// and are cleaned up.
    ///
    /// # Errors
    ///
    /// Returns an error if the expiry scan fails; per-instance failures are
    /// logged and retried on the next sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let expired = self.coordinator.expired(now).await?;
        let swept = expired.len();
        for state in expired {
            self.sweep_instance(state).await;
        }
        Ok(swept)
    }

    async fn sweep_instance(&self, state: NodeInputState) {
        let node_execution_id = state.node_execution_id;
        let execution_id = state.execution_id;

        let context = match self.contexts.get(execution_id).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                tracing::warn!(%execution_id, %node_execution_id, "expired instance has no execution context, discarding");
                let _ = self.coordinator.cleanup_node_execution(node_execution_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(%execution_id, error = %e, "failed to load context for expired instance");
                return;
            }
        };
        let published_workflow_id = context.published_workflow_id;

        let tolerant = !state.received_inputs.is_empty()
            && matches!(
                state.requirements.wait_mode,
                WaitMode::Any | WaitMode::First | WaitMode::Unknown
            );

        if !tolerant {
            tracing::info!(node_id = %state.node_id, %execution_id, %node_execution_id, "input wait timed out");
            if let Err(e) = self
                .emit_completion(
                    published_workflow_id,
                    execution_id,
                    state.node_id,
                    NodeResultStatus::Error,
                    HashMap::new(),
                    Some("input timeout".to_string()),
                    &Trace::default(),
                )
                .await
            {
                tracing::warn!(error = %e, "failed to emit timeout completion");
                return;
            }
            let _ = self.coordinator.cleanup_node_execution(node_execution_id).await;
            return;
        }

        // Fire with what arrived.
        let node = match self
            .nodes
            .node_from_published_workflow(published_workflow_id, state.node_id)
            .await
        {
            Ok(Some(node)) => node,
            Ok(None) => {
                tracing::warn!(node_id = %state.node_id, "expired instance references missing node, discarding");
                let _ = self.coordinator.cleanup_node_execution(node_execution_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load node for expired instance");
                return;
            }
        };
        let handler = match self
            .registry
            .create_node(&node.node_type, node.id, &node.config)
        {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!(node_id = %node.id, error = %e, "node creation rejected during sweep");
                let _ = self.coordinator.cleanup_node_execution(node_execution_id).await;
                return;
            }
        };

        if let Err(e) = self
            .fire(
                published_workflow_id,
                &node,
                handler.as_ref(),
                state,
                &Trace::default(),
            )
            .await
        {
            // Retried by the next sweep; the state is still in place.
            tracing::warn!(node_id = %node.id, %execution_id, error = %e, "sweep firing failed");
        }
    }
}

#[async_trait]
impl EventHandler for WorkerManager {
    async fn handle(
        &self,
        event: WorkflowEvent,
        headers: &EventHeaders,
    ) -> Result<(), HandlerError> {
        match event {
            WorkflowEvent::NodeActivation(activation) => {
                self.handle_activation(activation, Trace::from_headers(headers))
                    .await
            }
            WorkflowEvent::NodeCompletion(completion) => {
                // Completions are consumed by observers (terminator); a
                // worker receiving one acks it untouched.
                tracing::debug!(node_id = %completion.node_id, "ignoring completion event");
                Ok(())
            }
        }
    }
}

fn repo_to_handler(e: RepositoryError) -> HandlerError {
    if e.is_transient() {
        HandlerError::retryable(e.to_string())
    } else {
        HandlerError::fatal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::connection::Connection;
    use crate::context::ExecutionContext;
    use crate::event::EventType;
    use crate::node::NodeId;
    use crate::registry::{NodeConfigError, NodeExecutionError, NodeFactory};
    use crate::requirements::InputRequirements;
    use crate::store::MemoryStore;
    use crate::workflow::PublishedWorkflow;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        store: Arc<MemoryStore>,
        bus: InMemoryEventBus,
        worker: Arc<WorkerManager>,
        published_workflow_id: PublishedWorkflowId,
    }

    impl Harness {
        async fn start_execution(&self) -> ExecutionId {
            let context = ExecutionContext::new(
                ExecutionId::new(),
                self.published_workflow_id,
                json!({}),
                HashMap::new(),
            );
            self.store.update(&context).await.unwrap();
            context.execution_id
        }

        async fn activate(
            &self,
            execution_id: ExecutionId,
            node_id: NodeId,
            port: &str,
            data: HashMap<String, JsonValue>,
        ) {
            let activation = NodeActivation::new(
                self.published_workflow_id,
                execution_id,
                node_id,
                port,
                data,
                node_id,
                "external",
            );
            self.publish_activation(activation).await;
        }

        async fn publish_activation(&self, activation: NodeActivation) {
            let envelope =
                Envelope::from_event(&WorkflowEvent::NodeActivation(activation), None, None)
                    .unwrap();
            self.bus.publish(envelope).await.unwrap();
        }

        async fn context(&self, execution_id: ExecutionId) -> ExecutionContext {
            self.store.get(execution_id).await.unwrap().expect("context")
        }

        fn completions(&self) -> Vec<NodeCompletion> {
            self.bus
                .history()
                .iter()
                .filter_map(|envelope| envelope.decode_event().ok())
                .filter_map(|event| match event {
                    WorkflowEvent::NodeCompletion(completion) => Some(completion),
                    WorkflowEvent::NodeActivation(_) => None,
                })
                .collect()
        }

        fn activations(&self) -> Vec<NodeActivation> {
            self.bus
                .history()
                .iter()
                .filter_map(|envelope| envelope.decode_event().ok())
                .filter_map(|event| match event {
                    WorkflowEvent::NodeActivation(activation) => Some(activation),
                    WorkflowEvent::NodeCompletion(_) => None,
                })
                .collect()
        }

        fn completions_for(&self, node_id: NodeId) -> Vec<NodeCompletion> {
            self.completions()
                .into_iter()
                .filter(|c| c.node_id == node_id)
                .collect()
        }
    }

    async fn harness_with(workflow: PublishedWorkflow, registry: NodeRegistry) -> Harness {
        let published_workflow_id = workflow.id;
        let store = Arc::new(MemoryStore::new());
        store.insert_workflow(workflow).await;

        let bus = InMemoryEventBus::recording(4);
        let worker = Arc::new(WorkerManager::new(
            WorkerId::new(),
            WorkerSettings::default(),
            Arc::new(registry),
            Arc::new(bus.clone()),
            EngineStores::from_memory(&store),
        ));
        bus.register(EventType::NodeActivation, worker.clone());

        Harness {
            store,
            bus,
            worker,
            published_workflow_id,
        }
    }

    async fn harness(workflow: PublishedWorkflow) -> Harness {
        harness_with(workflow, NodeRegistry::with_builtins()).await
    }

    /// Merge node with explicit input requirements, for coordination tests.
    struct MergeFactory {
        requirements: InputRequirements,
    }

    impl NodeFactory for MergeFactory {
        fn node_type(&self) -> &str {
            "merge"
        }

        fn create(
            &self,
            node_id: NodeId,
            _config: &JsonValue,
        ) -> Result<Box<dyn NodeHandler>, NodeConfigError> {
            Ok(Box::new(MergeHandler {
                node_id,
                requirements: self.requirements.clone(),
            }))
        }
    }

    struct MergeHandler {
        node_id: NodeId,
        requirements: InputRequirements,
    }

    #[async_trait]
    impl NodeHandler for MergeHandler {
        async fn execute(
            &self,
            _context: &ExecutionContext,
            inputs: &HashMap<String, NodeResult>,
        ) -> Result<HashMap<String, NodeResult>, NodeExecutionError> {
            let mut data = HashMap::new();
            for (port, result) in inputs {
                data.insert(port.clone(), json!(result.data.clone()));
            }
            Ok(HashMap::from([(
                "out".to_string(),
                NodeResult::success(self.node_id, data),
            )]))
        }

        fn input_requirements(&self) -> Option<InputRequirements> {
            Some(self.requirements.clone())
        }
    }

    /// Counter node driving loop tests: emits on `next` until the limit.
    struct CounterFactory {
        counter: Arc<AtomicU32>,
        limit: u32,
    }

    impl NodeFactory for CounterFactory {
        fn node_type(&self) -> &str {
            "counter"
        }

        fn create(
            &self,
            node_id: NodeId,
            _config: &JsonValue,
        ) -> Result<Box<dyn NodeHandler>, NodeConfigError> {
            Ok(Box::new(CounterHandler {
                node_id,
                counter: self.counter.clone(),
                limit: self.limit,
            }))
        }
    }

    struct CounterHandler {
        node_id: NodeId,
        counter: Arc<AtomicU32>,
        limit: u32,
    }

    #[async_trait]
    impl NodeHandler for CounterHandler {
        async fn execute(
            &self,
            _context: &ExecutionContext,
            _inputs: &HashMap<String, NodeResult>,
        ) -> Result<HashMap<String, NodeResult>, NodeExecutionError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let port = if n < self.limit { "next" } else { "stop" };
            Ok(HashMap::from([(
                port.to_string(),
                NodeResult::success(
                    self.node_id,
                    HashMap::from([("n".to_string(), json!(n))]),
                ),
            )]))
        }

        fn input_requirements(&self) -> Option<InputRequirements> {
            Some(InputRequirements::first())
        }
    }

    /// Node whose handler always fails.
    struct FailingFactory;

    impl NodeFactory for FailingFactory {
        fn node_type(&self) -> &str {
            "failing"
        }

        fn create(
            &self,
            _node_id: NodeId,
            _config: &JsonValue,
        ) -> Result<Box<dyn NodeHandler>, NodeConfigError> {
            Ok(Box::new(FailingHandler))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl NodeHandler for FailingHandler {
        async fn execute(
            &self,
            _context: &ExecutionContext,
            _inputs: &HashMap<String, NodeResult>,
        ) -> Result<HashMap<String, NodeResult>, NodeExecutionError> {
            Err(NodeExecutionError::ExecutionFailed {
                message: "induced failure".to_string(),
            })
        }

        fn input_requirements(&self) -> Option<InputRequirements> {
            Some(InputRequirements::first())
        }
    }

    /// Node that returns an error result on its `error` port.
    struct ErrorPortFactory;

    impl NodeFactory for ErrorPortFactory {
        fn node_type(&self) -> &str {
            "error_port"
        }

        fn create(
            &self,
            node_id: NodeId,
            _config: &JsonValue,
        ) -> Result<Box<dyn NodeHandler>, NodeConfigError> {
            Ok(Box::new(ErrorPortHandler { node_id }))
        }
    }

    struct ErrorPortHandler {
        node_id: NodeId,
    }

    #[async_trait]
    impl NodeHandler for ErrorPortHandler {
        async fn execute(
            &self,
            _context: &ExecutionContext,
            _inputs: &HashMap<String, NodeResult>,
        ) -> Result<HashMap<String, NodeResult>, NodeExecutionError> {
            Ok(HashMap::from([(
                "error".to_string(),
                NodeResult::error(self.node_id, "bad upstream payload"),
            )]))
        }

        fn input_requirements(&self) -> Option<InputRequirements> {
            Some(InputRequirements::first())
        }
    }

    #[tokio::test]
    async fn linear_chain_propagates_results() {
        let mut workflow = PublishedWorkflow::new("linear");
        let a = Node::action("A", "set_value", json!({"values": {"x": 1}}));
        let b = Node::action("B", "passthrough", json!({}));
        let c = Node::action("C", "passthrough", json!({}));
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        workflow.add_node(a).unwrap();
        workflow.add_node(b).unwrap();
        workflow.add_node(c).unwrap();
        workflow
            .add_connection(Connection::new(a_id, "out", b_id, "in"))
            .unwrap();
        workflow
            .add_connection(Connection::new(b_id, "out", c_id, "in"))
            .unwrap();

        let harness = harness(workflow).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(execution_id, a_id, "input", HashMap::new())
            .await;
        harness.bus.pump().await;

        let context = harness.context(execution_id).await;
        for node_id in [a_id, b_id, c_id] {
            let result = context.result_for(node_id, "out").expect("result recorded");
            assert_eq!(result.data["x"], json!(1));
        }
        assert_eq!(harness.completions().len(), 3);
        assert_eq!(harness.store.coordination_state_count().await, 0);
    }

    #[tokio::test]
    async fn merge_all_fires_once_with_both_inputs() {
        for reversed in [false, true] {
            let mut workflow = PublishedWorkflow::new("merge");
            let m = Node::action("M", "merge", json!({}));
            let m_id = m.id;
            workflow.add_node(m).unwrap();

            let mut registry = NodeRegistry::with_builtins();
            registry.register(Arc::new(MergeFactory {
                requirements: InputRequirements::all_of(["left", "right"]),
            }));

            let harness = harness_with(workflow, registry).await;
            let execution_id = harness.start_execution().await;

            let mut ports = vec![("left", json!(1)), ("right", json!(2))];
            if reversed {
                ports.reverse();
            }

            let (first_port, first_value) = ports[0].clone();
            harness
                .activate(
                    execution_id,
                    m_id,
                    first_port,
                    HashMap::from([("v".to_string(), first_value)]),
                )
                .await;
            harness.bus.pump().await;
            assert!(harness.completions().is_empty());
            assert_eq!(harness.store.coordination_state_count().await, 1);

            let (second_port, second_value) = ports[1].clone();
            harness
                .activate(
                    execution_id,
                    m_id,
                    second_port,
                    HashMap::from([("v".to_string(), second_value)]),
                )
                .await;
            harness.bus.pump().await;

            let completions = harness.completions();
            assert_eq!(completions.len(), 1);
            assert_eq!(completions[0].status, NodeResultStatus::Success);

            let context = harness.context(execution_id).await;
            let result = context.result_for(m_id, "out").expect("merged result");
            assert!(result.data.contains_key("left"));
            assert!(result.data.contains_key("right"));
            assert_eq!(harness.store.coordination_state_count().await, 0);
        }
    }

    #[tokio::test]
    async fn merge_any_refires_on_late_input() {
        let mut workflow = PublishedWorkflow::new("any");
        let m = Node::action("M", "merge", json!({}));
        let m_id = m.id;
        workflow.add_node(m).unwrap();

        let mut registry = NodeRegistry::with_builtins();
        registry.register(Arc::new(MergeFactory {
            requirements: InputRequirements::any_of(["left", "right"]),
        }));

        let harness = harness_with(workflow, registry).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(execution_id, m_id, "left", HashMap::new())
            .await;
        harness.bus.pump().await;
        assert_eq!(harness.completions().len(), 1);
        assert_eq!(harness.store.coordination_state_count().await, 0);

        // The pending instance fired and was cleaned up; the late input
        // starts a fresh one, which also fires immediately.
        harness
            .activate(execution_id, m_id, "right", HashMap::new())
            .await;
        harness.bus.pump().await;
        assert_eq!(harness.completions().len(), 2);
        assert_eq!(harness.store.coordination_state_count().await, 0);
    }

    #[tokio::test]
    async fn loop_runs_iterations_in_order() {
        let mut workflow = PublishedWorkflow::new("loop");
        let a = Node::action("A", "passthrough", json!({}));
        let b = Node::action("B", "counter", json!({}));
        let (a_id, b_id) = (a.id, b.id);
        workflow.add_node(a).unwrap();
        workflow.add_node(b).unwrap();
        workflow
            .add_connection(Connection::new(a_id, "out", b_id, "in"))
            .unwrap();
        workflow
            .add_connection(Connection::new(b_id, "next", a_id, "in"))
            .unwrap();

        let mut registry = NodeRegistry::with_builtins();
        registry.register(Arc::new(CounterFactory {
            counter: Arc::new(AtomicU32::new(0)),
            limit: 3,
        }));

        let harness = harness_with(workflow, registry).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(
                execution_id,
                a_id,
                "in",
                HashMap::from([("n".to_string(), json!(0))]),
            )
            .await;
        harness.bus.pump().await;

        // Three distinct instances of each node fired, in partition order.
        assert_eq!(harness.completions_for(a_id).len(), 3);
        assert_eq!(harness.completions_for(b_id).len(), 3);

        // A::out was overwritten each iteration; the last value is the data
        // carried by the final loop-back.
        let context = harness.context(execution_id).await;
        assert_eq!(
            context.result_for(a_id, "out").expect("looped result").data["n"],
            json!(2)
        );
        assert_eq!(harness.store.coordination_state_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let mut workflow = PublishedWorkflow::new("dup");
        let a = Node::action("A", "set_value", json!({"values": {"x": 1}}));
        let b = Node::action("B", "passthrough", json!({}));
        let (a_id, b_id) = (a.id, b.id);
        workflow.add_node(a).unwrap();
        workflow.add_node(b).unwrap();
        workflow
            .add_connection(Connection::new(a_id, "out", b_id, "in"))
            .unwrap();

        let harness = harness(workflow).await;
        let execution_id = harness.start_execution().await;

        let activation = NodeActivation::new(
            harness.published_workflow_id,
            execution_id,
            a_id,
            "input",
            HashMap::new(),
            a_id,
            "external",
        );
        for _ in 0..3 {
            harness.publish_activation(activation.clone()).await;
        }
        harness.bus.pump().await;

        // Refirings produce identical outputs: the set of result keys does
        // not grow, and downstream sees one distinct activation target.
        let context = harness.context(execution_id).await;
        let mut keys: Vec<String> = context.node_results.keys().cloned().collect();
        keys.sort();
        let mut expected = vec![
            ExecutionContext::result_key(a_id, "out"),
            ExecutionContext::result_key(b_id, "out"),
        ];
        expected.sort();
        assert_eq!(keys, expected);

        let downstream: std::collections::HashSet<(NodeId, ExecutionId, String)> = harness
            .activations()
            .into_iter()
            .filter(|activation| activation.source_node == a_id && activation.source_port == "out")
            .map(|activation| {
                (
                    activation.node_id,
                    activation.execution_id,
                    activation.input_port,
                )
            })
            .collect();
        assert_eq!(downstream.len(), 1);
    }

    #[tokio::test]
    async fn timeout_completes_with_error_and_cleans_up() {
        let mut workflow = PublishedWorkflow::new("timeout");
        let m = Node::action("M", "merge", json!({}));
        let m_id = m.id;
        workflow.add_node(m).unwrap();

        let mut registry = NodeRegistry::with_builtins();
        registry.register(Arc::new(MergeFactory {
            requirements: InputRequirements::all_of(["left", "right"]).with_timeout_ms(100),
        }));

        let harness = harness_with(workflow, registry).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(execution_id, m_id, "left", HashMap::new())
            .await;
        harness.bus.pump().await;
        assert!(harness.completions().is_empty());

        let swept = harness
            .worker
            .sweep_expired(Utc::now() + chrono::Duration::milliseconds(150))
            .await
            .unwrap();
        harness.bus.pump().await;

        assert_eq!(swept, 1);
        let completions = harness.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, NodeResultStatus::Error);
        assert_eq!(completions[0].error_message.as_deref(), Some("input timeout"));
        assert_eq!(harness.store.coordination_state_count().await, 0);
    }

    #[tokio::test]
    async fn tolerant_timeout_fires_with_partial_inputs() {
        let mut workflow = PublishedWorkflow::new("tolerant");
        let m = Node::action("M", "merge", json!({}));
        let m_id = m.id;
        workflow.add_node(m).unwrap();

        // ANY over required ports, but only an optional port arrived, so the
        // instance never became ready on its own.
        let mut registry = NodeRegistry::with_builtins();
        registry.register(Arc::new(MergeFactory {
            requirements: InputRequirements::any_of(["left", "right"])
                .with_optional(["hint"])
                .with_timeout_ms(100),
        }));

        let harness = harness_with(workflow, registry).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(
                execution_id,
                m_id,
                "hint",
                HashMap::from([("h".to_string(), json!(true))]),
            )
            .await;
        harness.bus.pump().await;
        assert!(harness.completions().is_empty());

        harness
            .worker
            .sweep_expired(Utc::now() + chrono::Duration::milliseconds(150))
            .await
            .unwrap();
        harness.bus.pump().await;

        let completions = harness.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, NodeResultStatus::Success);

        let context = harness.context(execution_id).await;
        assert!(context.result_for(m_id, "out").is_some());
        assert_eq!(harness.store.coordination_state_count().await, 0);
    }

    #[tokio::test]
    async fn missing_node_completes_with_error() {
        let workflow = PublishedWorkflow::new("empty");
        let harness = harness(workflow).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(execution_id, NodeId::new(), "in", HashMap::new())
            .await;
        harness.bus.pump().await;

        let completions = harness.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, NodeResultStatus::Error);
        assert!(completions[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("not found in snapshot"));
    }

    #[tokio::test]
    async fn disabled_node_completes_as_skipped() {
        let mut workflow = PublishedWorkflow::new("disabled");
        let node =
            Node::action("Off", "passthrough", json!({})).with_enabled(false);
        let node_id = node.id;
        workflow.add_node(node).unwrap();

        let harness = harness(workflow).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(execution_id, node_id, "in", HashMap::new())
            .await;
        harness.bus.pump().await;

        let completions = harness.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, NodeResultStatus::Skipped);
        assert_eq!(harness.store.coordination_state_count().await, 0);
    }

    #[tokio::test]
    async fn rejected_config_completes_with_error() {
        let mut workflow = PublishedWorkflow::new("badconfig");
        let node = Node::action("Bad", "passthrough", json!({"port": 42}));
        let node_id = node.id;
        workflow.add_node(node).unwrap();

        let harness = harness(workflow).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(execution_id, node_id, "in", HashMap::new())
            .await;
        harness.bus.pump().await;

        let completions = harness.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, NodeResultStatus::Error);
        assert!(completions[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("invalid config"));
    }

    #[tokio::test]
    async fn missing_context_completes_with_error() {
        let mut workflow = PublishedWorkflow::new("noctx");
        let node = Node::action("A", "set_value", json!({"values": {"x": 1}}));
        let node_id = node.id;
        workflow.add_node(node).unwrap();

        let harness = harness(workflow).await;
        let execution_id = ExecutionId::new(); // no context persisted

        harness
            .activate(execution_id, node_id, "input", HashMap::new())
            .await;
        harness.bus.pump().await;

        let completions = harness.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, NodeResultStatus::Error);
        assert!(completions[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("execution context not found"));
    }

    #[tokio::test]
    async fn execution_failure_keeps_state_for_redelivery() {
        let mut workflow = PublishedWorkflow::new("failing");
        let node = Node::action("F", "failing", json!({}));
        let node_id = node.id;
        workflow.add_node(node).unwrap();

        let mut registry = NodeRegistry::with_builtins();
        registry.register(Arc::new(FailingFactory));

        let published_workflow_id = workflow.id;
        let store = Arc::new(MemoryStore::new());
        store.insert_workflow(workflow).await;
        let bus = InMemoryEventBus::recording(4).with_max_attempts(2);
        let worker = Arc::new(WorkerManager::new(
            WorkerId::new(),
            WorkerSettings::default(),
            Arc::new(registry),
            Arc::new(bus.clone()),
            EngineStores::from_memory(&store),
        ));
        bus.register(EventType::NodeActivation, worker.clone());
        let harness = Harness {
            store,
            bus,
            worker,
            published_workflow_id,
        };

        let execution_id = harness.start_execution().await;
        harness
            .activate(execution_id, node_id, "in", HashMap::new())
            .await;
        harness.bus.pump().await;

        // One error completion per delivery attempt; state survives so the
        // redelivered activation can retry the same instance.
        let completions = harness.completions_for(node_id);
        assert_eq!(completions.len(), 2);
        assert!(completions
            .iter()
            .all(|c| c.status == NodeResultStatus::Error));
        assert_eq!(harness.store.coordination_state_count().await, 1);
    }

    #[tokio::test]
    async fn returned_error_result_fans_out_on_error_port() {
        let mut workflow = PublishedWorkflow::new("errorport");
        let e = Node::action("E", "error_port", json!({}));
        let h = Node::action("H", "passthrough", json!({}));
        let (e_id, h_id) = (e.id, h.id);
        workflow.add_node(e).unwrap();
        workflow.add_node(h).unwrap();
        workflow
            .add_connection(Connection::new(e_id, "error", h_id, "in"))
            .unwrap();

        let mut registry = NodeRegistry::with_builtins();
        registry.register(Arc::new(ErrorPortFactory));

        let harness = harness_with(workflow, registry).await;
        let execution_id = harness.start_execution().await;

        harness
            .activate(execution_id, e_id, "in", HashMap::new())
            .await;
        harness.bus.pump().await;

        let e_completions = harness.completions_for(e_id);
        assert_eq!(e_completions.len(), 1);
        assert_eq!(e_completions[0].status, NodeResultStatus::Error);
        assert_eq!(
            e_completions[0].error_message.as_deref(),
            Some("bad upstream payload")
        );

        // The error result is persisted and the error-port successor fired.
        let context = harness.context(execution_id).await;
        assert!(context.result_for(e_id, "error").is_some());
        assert!(context.result_for(h_id, "out").is_some());
        assert_eq!(harness.completions_for(h_id).len(), 1);
    }
}
