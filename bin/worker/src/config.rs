//! Worker process configuration.
//!
//! Two layers, both environment-friendly:
//! - The CLI surface (`clap`): identity and provider selection. Every flag
//!   is mirrored by an uppercase environment variable.
//! - Operational tuning (`config` crate): timeouts, partitions, and bus
//!   parameters from `OPERION__`-prefixed environment variables.

use clap::{Parser, ValueEnum};
use operion_engine::nats::NatsBusConfig;
use operion_engine::worker::WorkerSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the worker process.
#[derive(Debug, Parser)]
#[command(name = "operion-worker", version, about = "Operion workflow execution worker")]
pub struct WorkerArgs {
    /// Worker identifier; auto-generated when absent.
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Database URL selecting the persistence provider. The in-tree
    /// provider is `memory://`; SQL backends plug in via the repository
    /// traits.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Event bus provider.
    #[arg(long, env = "EVENT_BUS", value_enum)]
    pub event_bus: EventBusProvider,

    /// Directory of dynamically loaded node factories.
    #[arg(long, env = "PLUGINS_PATH")]
    pub plugins_path: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Configured event bus providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventBusProvider {
    /// NATS JetStream.
    Nats,
    /// In-process bus for single-worker deployments.
    Memory,
}

/// Operational settings loaded from `OPERION__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct OperionSettings {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Partition count; must match across the deployment.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Deadline for a single node execution, in seconds.
    #[serde(default = "default_node_timeout_seconds")]
    pub node_timeout_seconds: u64,

    /// Interval between input-timeout sweeps, in seconds.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Bound on bus delivery attempts per message.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_partitions() -> u32 {
    8
}

fn default_node_timeout_seconds() -> u64 {
    30
}

fn default_sweep_interval_seconds() -> u64 {
    5
}

fn default_max_delivery_attempts() -> u32 {
    5
}

impl Default for OperionSettings {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            partitions: default_partitions(),
            node_timeout_seconds: default_node_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

impl OperionSettings {
    /// Loads settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparsable.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("OPERION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Returns the worker settings derived from these values.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            node_timeout: Duration::from_secs(self.node_timeout_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
        }
    }

    /// Returns the NATS bus configuration derived from these values.
    #[must_use]
    pub fn nats_config(&self) -> NatsBusConfig {
        NatsBusConfig {
            partitions: Some(self.partitions),
            max_deliver: Some(i64::from(self.max_delivery_attempts)),
            ..NatsBusConfig::new(self.nats_url.clone())
        }
    }
}
