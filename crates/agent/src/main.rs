//! TRACE agent
//!
//! Runs the tower engine behind an HTTP API and scans the network for issues
//! on a fixed interval.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trace_agent::{api, config::AgentConfig};
use trace_engine::{
    DetectionScheduler, HealthRegistry, InMemoryStore, JsonFileStore, RemediationLedger,
    SharedStore, StructuredLogger, TowerNetwork,
};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AgentConfig::load()?;
    info!(node_name = %config.node_name, "Agent configured");

    let engine_config = config.engine_config();
    let topology = Arc::new(config.topology()?);

    let store: SharedStore = match &config.state_path {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .with_context(|| format!("Failed to open state store {}", path.display()))?,
        ),
        None => Arc::new(InMemoryStore::new()),
    };
    let ledger = match &config.ledger_path {
        Some(path) => RemediationLedger::open(path)
            .with_context(|| format!("Failed to open remediation ledger {}", path.display()))?,
        None => RemediationLedger::in_memory(),
    }
    .with_timeout(engine_config.persistence_timeout);

    let logger = StructuredLogger::new(&config.node_name);
    let network = Arc::new(
        TowerNetwork::new(topology.clone(), store, Arc::new(ledger), engine_config)
            .with_logger(logger.clone()),
    );

    let reopened = network.recover().await;
    if reopened > 0 {
        warn!(open = reopened, "Open remediations carried over from a previous run");
    }

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    logger.log_startup(AGENT_VERSION, topology.len(), config.auto_heal);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let scheduler = DetectionScheduler::new(
        network.clone(),
        health_registry.clone(),
        config.scheduler_config(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(network, health_registry.clone()));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Detection scheduler task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
