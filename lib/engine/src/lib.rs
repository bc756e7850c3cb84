//! Distributed execution engine for the operion platform.
//!
//! This crate provides the node-based workflow execution core, including:
//!
//! - **Snapshot Model**: Immutable published workflows with typed nodes and
//!   port-to-port connections
//! - **Execution Context**: Per-run state carrying trigger data, variables,
//!   and accumulated node results
//! - **Event Bus**: Partitioned, at-least-once publish/subscribe with keyed
//!   ordering (NATS JetStream and in-memory providers)
//! - **Input Coordination**: Durable per-instance input gathering with
//!   ALL/ANY/FIRST readiness and FIFO loop semantics
//! - **Worker**: The activation handler that executes nodes and fans out to
//!   successors
//! - **Dispatcher**: Translation of trigger firings into initial activations

pub mod bus;
pub mod connection;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod nats;
pub mod node;
pub mod registry;
pub mod repository;
pub mod requirements;
pub mod store;
pub mod worker;
pub mod workflow;

pub use bus::{BusError, EventBus, EventHandler, HandlerError, InMemoryEventBus};
pub use connection::{Connection, PortRef};
pub use context::{ExecutionContext, ExecutionStatus, NodeResult, NodeResultStatus};
pub use coordinator::{InputCoordinator, NodeInputState};
pub use dispatcher::{DispatchError, Dispatcher, TriggerFire};
pub use envelope::{Envelope, EnvelopeError, EventHeaders, RawEnvelope};
pub use event::{EventType, NodeActivation, NodeCompletion, WorkflowEvent};
pub use nats::{NatsBusConfig, NatsEventBus};
pub use node::{Node, NodeCategory, NodeId};
pub use registry::{NodeConfigError, NodeExecutionError, NodeFactory, NodeHandler, NodeRegistry};
pub use repository::{
    ConnectionRepository, EngineStores, ExecutionContextRepository, InputCoordinationRepository,
    NodeRepository, RepositoryError, WorkflowRepository,
};
pub use requirements::{InputRequirements, WaitMode};
pub use store::MemoryStore;
pub use worker::{WorkerManager, WorkerSettings};
pub use workflow::{GraphError, PublishedWorkflow};
