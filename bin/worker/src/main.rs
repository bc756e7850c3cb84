//! The operion worker process.
//!
//! Wires the per-worker singletons — registry, persistence, bus adapter —
//! and runs the activation consumer plus the timeout sweeper until a
//! shutdown signal arrives.

mod config;

use clap::Parser;
use config::{EventBusProvider, OperionSettings, WorkerArgs};
use operion_core::WorkerId;
use operion_engine::bus::{EventBus, InMemoryEventBus};
use operion_engine::event::EventType;
use operion_engine::nats::NatsEventBus;
use operion_engine::registry::NodeRegistry;
use operion_engine::repository::EngineStores;
use operion_engine::store::MemoryStore;
use operion_engine::worker::WorkerManager;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = WorkerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = OperionSettings::from_env().expect("failed to load configuration");

    let worker_id = match &args.worker_id {
        Some(raw) => match raw.parse::<WorkerId>() {
            Ok(worker_id) => worker_id,
            Err(e) => {
                tracing::error!(worker_id = %raw, error = %e, "invalid --worker-id");
                std::process::exit(1);
            }
        },
        None => WorkerId::new(),
    };
    tracing::info!(%worker_id, "starting operion worker");

    // Persistence provider. The repository traits are the backend boundary;
    // memory:// is the only provider shipped in tree.
    let store = if args.database_url.starts_with("memory://") {
        Arc::new(MemoryStore::new())
    } else {
        tracing::error!(
            database_url = %args.database_url,
            "unsupported database scheme, expected memory://"
        );
        std::process::exit(1);
    };

    let registry = Arc::new(NodeRegistry::with_builtins());
    if let Some(path) = &args.plugins_path {
        tracing::warn!(
            path = %path.display(),
            "no plugin loader configured; node libraries register factories at link time"
        );
    }
    tracing::info!(node_types = ?registry.node_types(), "node registry ready");

    let bus: Arc<dyn EventBus> = match args.event_bus {
        EventBusProvider::Nats => {
            tracing::info!(url = %settings.nats_url, "connecting to NATS");
            Arc::new(
                NatsEventBus::new(settings.nats_config())
                    .await
                    .expect("failed to connect to NATS"),
            )
        }
        EventBusProvider::Memory => Arc::new(InMemoryEventBus::new(settings.partitions)),
    };

    let worker = Arc::new(WorkerManager::new(
        worker_id,
        settings.worker_settings(),
        registry,
        bus.clone(),
        EngineStores::from_memory(&store),
    ));

    bus.register(EventType::NodeActivation, worker.clone());
    bus.subscribe().await.expect("failed to subscribe");
    tracing::info!("consuming node activations");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(worker.clone().run_timeout_sweeper(shutdown_rx));

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    bus.close().await.expect("failed to close event bus");
    tracing::info!("shut down cleanly");
}

/// Waits for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
