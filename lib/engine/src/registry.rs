//! Node registry: factories keyed by type string.
//!
//! Concrete node libraries (HTTP, transform, conditional, log) live outside
//! the engine; they plug in by registering factories. The engine ships a
//! pass-through node and a static-value node, enough to wire deployments
//! together and to exercise the worker in tests.
//!
//! Node instances are cheap and re-created per activation; the registry is
//! read-only after startup.

use crate::context::{ExecutionContext, NodeResult};
use crate::node::NodeId;
use crate::requirements::InputRequirements;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors from node creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeConfigError {
    /// No factory is registered for the type.
    UnknownNodeType { node_type: String },
    /// The factory rejected the configuration.
    InvalidConfig { node_type: String, message: String },
}

impl std::fmt::Display for NodeConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNodeType { node_type } => {
                write!(f, "unknown node type: {node_type}")
            }
            Self::InvalidConfig { node_type, message } => {
                write!(f, "invalid config for {node_type}: {message}")
            }
        }
    }
}

impl std::error::Error for NodeConfigError {}

/// Errors from node execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeExecutionError {
    /// Input validation failed.
    InvalidInput { message: String },
    /// Execution failed.
    ExecutionFailed { message: String },
    /// External service error.
    ExternalServiceError { service: String, message: String },
    /// Execution exceeded its deadline.
    Timeout,
}

impl std::fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::ExternalServiceError { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
            Self::Timeout => write!(f, "execution timed out"),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

/// A node instance, created per activation.
///
/// Execution is pure with respect to the worker: side effects such as HTTP
/// calls are the node's own responsibility, and it must not mutate the
/// execution context directly.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Executes the node against its gathered inputs.
    ///
    /// Returns the produced results by output port. Unconnected output ports
    /// are silently dropped at fan-out.
    async fn execute(
        &self,
        context: &ExecutionContext,
        inputs: &HashMap<String, NodeResult>,
    ) -> Result<HashMap<String, NodeResult>, NodeExecutionError>;

    /// The node type's declared input requirements.
    ///
    /// Optional capability; `None` means the registry default of a single
    /// required `input` port with wait mode ALL.
    fn input_requirements(&self) -> Option<InputRequirements> {
        None
    }
}

/// A factory producing node instances for one node type.
pub trait NodeFactory: Send + Sync {
    /// The type string this factory handles.
    fn node_type(&self) -> &str;

    /// Validates the configuration and creates a node instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is rejected.
    fn create(
        &self,
        node_id: NodeId,
        config: &JsonValue,
    ) -> Result<Box<dyn NodeHandler>, NodeConfigError>;
}

/// A registry of node factories keyed by type string.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in node types registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PassthroughFactory));
        registry.register(Arc::new(SetValueFactory));
        registry
    }

    /// Registers a factory; a later registration for the same type wins.
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        self.factories
            .insert(factory.node_type().to_string(), factory);
    }

    /// Returns the registered type strings.
    #[must_use]
    pub fn node_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Creates a node instance, validating its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the type is unknown or the config invalid.
    pub fn create_node(
        &self,
        node_type: &str,
        node_id: NodeId,
        config: &JsonValue,
    ) -> Result<Box<dyn NodeHandler>, NodeConfigError> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| NodeConfigError::UnknownNodeType {
                node_type: node_type.to_string(),
            })?;
        factory.create(node_id, config)
    }

    /// Returns a node instance's input requirements, falling back to the
    /// registry default when the capability is not implemented.
    #[must_use]
    pub fn requirements_of(handler: &dyn NodeHandler) -> InputRequirements {
        handler
            .input_requirements()
            .unwrap_or_else(InputRequirements::single_input)
    }
}

/// Pass-through node: merges the data of all received inputs onto one
/// output port.
pub struct PassthroughFactory;

impl NodeFactory for PassthroughFactory {
    fn node_type(&self) -> &str {
        "passthrough"
    }

    fn create(
        &self,
        node_id: NodeId,
        config: &JsonValue,
    ) -> Result<Box<dyn NodeHandler>, NodeConfigError> {
        let port = match config.get("port") {
            None => "out".to_string(),
            Some(JsonValue::String(port)) if !port.is_empty() => port.clone(),
            Some(_) => {
                return Err(NodeConfigError::InvalidConfig {
                    node_type: self.node_type().to_string(),
                    message: "port must be a non-empty string".to_string(),
                });
            }
        };
        Ok(Box::new(PassthroughHandler { node_id, port }))
    }
}

/// Handler for the pass-through node.
pub struct PassthroughHandler {
    node_id: NodeId,
    port: String,
}

#[async_trait]
impl NodeHandler for PassthroughHandler {
    async fn execute(
        &self,
        _context: &ExecutionContext,
        inputs: &HashMap<String, NodeResult>,
    ) -> Result<HashMap<String, NodeResult>, NodeExecutionError> {
        let mut data = HashMap::new();
        for result in inputs.values() {
            data.extend(result.data.clone());
        }
        Ok(HashMap::from([(
            self.port.clone(),
            NodeResult::success(self.node_id, data),
        )]))
    }

    fn input_requirements(&self) -> Option<InputRequirements> {
        Some(InputRequirements::first())
    }
}

/// Static-value node: emits its configured values, ignoring inputs.
pub struct SetValueFactory;

impl NodeFactory for SetValueFactory {
    fn node_type(&self) -> &str {
        "set_value"
    }

    fn create(
        &self,
        node_id: NodeId,
        config: &JsonValue,
    ) -> Result<Box<dyn NodeHandler>, NodeConfigError> {
        let values = match config.get("values") {
            Some(JsonValue::Object(values)) => values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(_) => {
                return Err(NodeConfigError::InvalidConfig {
                    node_type: self.node_type().to_string(),
                    message: "values must be an object".to_string(),
                });
            }
            None => HashMap::new(),
        };
        let port = config
            .get("port")
            .and_then(JsonValue::as_str)
            .unwrap_or("out")
            .to_string();
        Ok(Box::new(SetValueHandler {
            node_id,
            port,
            values,
        }))
    }
}

/// Handler for the static-value node.
pub struct SetValueHandler {
    node_id: NodeId,
    port: String,
    values: HashMap<String, JsonValue>,
}

#[async_trait]
impl NodeHandler for SetValueHandler {
    async fn execute(
        &self,
        _context: &ExecutionContext,
        _inputs: &HashMap<String, NodeResult>,
    ) -> Result<HashMap<String, NodeResult>, NodeExecutionError> {
        Ok(HashMap::from([(
            self.port.clone(),
            NodeResult::success(self.node_id, self.values.clone()),
        )]))
    }

    fn input_requirements(&self) -> Option<InputRequirements> {
        Some(InputRequirements::first())
    }
}
