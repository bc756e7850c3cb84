//! Core domain types for the operion workflow platform.
//!
//! This crate provides the strongly-typed identifiers shared by the
//! execution engine and the worker binary.

pub mod id;

pub use id::{EventId, ExecutionId, NodeExecutionId, ParseIdError, PublishedWorkflowId, WorkerId};
