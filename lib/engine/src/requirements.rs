//! Input requirements declared by node types.
//!
//! Requirements are static per node type: which input ports must deliver
//! data, which are consumed opportunistically, and the wait mode deciding
//! readiness. The input coordinator evaluates these against the durable
//! per-instance state.

use crate::context::NodeResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The rule by which the coordinator decides readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Every required port must have a value.
    #[default]
    All,
    /// At least one required port must have a value.
    Any,
    /// Any received input fires the node.
    First,
    /// Unrecognized mode from the wire; treated as `Any`.
    Unknown,
}

impl<'de> Deserialize<'de> for WaitMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Snapshots published by newer authoring versions may carry modes this
        // worker does not know; they must coordinate rather than fail decode.
        let mode = String::deserialize(deserializer)?;
        Ok(match mode.as_str() {
            "all" => Self::All,
            "any" => Self::Any,
            "first" => Self::First,
            _ => Self::Unknown,
        })
    }
}

/// A node type's declared input requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequirements {
    /// Ports that must deliver data.
    #[serde(default)]
    pub required_ports: Vec<String>,
    /// Ports whose data is consumed if present but not awaited.
    #[serde(default)]
    pub optional_ports: Vec<String>,
    /// Readiness rule.
    #[serde(default)]
    pub wait_mode: WaitMode,
    /// Optional upper bound on how long to wait for the full set, in
    /// milliseconds. Expired instances are handled by the timeout sweeper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl InputRequirements {
    /// Creates requirements waiting for all of the given ports.
    #[must_use]
    pub fn all_of(ports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_ports: ports.into_iter().map(Into::into).collect(),
            optional_ports: Vec::new(),
            wait_mode: WaitMode::All,
            timeout_ms: None,
        }
    }

    /// Creates requirements waiting for any of the given ports.
    #[must_use]
    pub fn any_of(ports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_ports: ports.into_iter().map(Into::into).collect(),
            optional_ports: Vec::new(),
            wait_mode: WaitMode::Any,
            timeout_ms: None,
        }
    }

    /// Creates requirements that fire on the first received input.
    #[must_use]
    pub fn first() -> Self {
        Self {
            required_ports: Vec::new(),
            optional_ports: Vec::new(),
            wait_mode: WaitMode::First,
            timeout_ms: None,
        }
    }

    /// The registry default for node types that declare nothing: a single
    /// required `input` port, waiting for all.
    #[must_use]
    pub fn single_input() -> Self {
        Self::all_of(["input"])
    }

    /// Adds optional ports.
    #[must_use]
    pub fn with_optional(mut self, ports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.optional_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the wait timeout in milliseconds.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Evaluates readiness against the received inputs.
    ///
    /// Inputs on ports outside `required_ports ∪ optional_ports` are stored
    /// by the coordinator but never contribute to `All`/`Any` readiness.
    #[must_use]
    pub fn is_satisfied_by(&self, received: &HashMap<String, NodeResult>) -> bool {
        match self.wait_mode {
            WaitMode::All => self
                .required_ports
                .iter()
                .all(|port| received.contains_key(port)),
            WaitMode::Any | WaitMode::Unknown => self
                .required_ports
                .iter()
                .any(|port| received.contains_key(port)),
            WaitMode::First => !received.is_empty(),
        }
    }
}

impl Default for InputRequirements {
    fn default() -> Self {
        Self::single_input()
    }
}
