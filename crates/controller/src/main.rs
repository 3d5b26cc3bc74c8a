//! Fleet controller - spot/stable switch orchestration service
//!
//! Runs the risk ledger, model gate, switch orchestrator, command channel,
//! and reconciliation sweeper behind one HTTP API.

use anyhow::Result;
use controller_lib::{
    health::{components, HealthRegistry},
    CandidateSelector, CommandChannel, ControllerMetrics, Inventory, LocalDispatcher, MockExecutor,
    ModelGate, PriceBook, ReconciliationSweeper, RiskLedger, StructuredLogger, SwitchLog,
    SwitchOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod evaluate;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleet-controller");

    // Load configuration
    let config = config::ControllerConfig::load()?;
    info!(controller_id = %config.controller_id, "Controller configured");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::RISK_LEDGER).await;
    health_registry.register(components::ORCHESTRATOR).await;
    health_registry.register(components::COMMAND_CHANNEL).await;
    health_registry.register(components::SWEEPER).await;

    // Initialize metrics
    let metrics = ControllerMetrics::new();

    // Initialize structured logger
    let logger = StructuredLogger::new(&config.controller_id);
    logger.log_startup(CONTROLLER_VERSION);

    // Core state
    let ledger = Arc::new(match config.poison_ttl_secs {
        Some(secs) => RiskLedger::with_ttl(Duration::from_secs(secs)),
        None => RiskLedger::new(),
    });
    let inventory = Arc::new(Inventory::new());
    let log = Arc::new(SwitchLog::new());
    let book = Arc::new(PriceBook::new());
    let gate = Arc::new(ModelGate::new());

    // The embedded executor applies provider commands in-process; a real
    // cloud binding implements the same trait
    let executor = Arc::new(MockExecutor::new());

    let channel = Arc::new(CommandChannel::new(
        config.channel(),
        ledger.clone(),
        inventory.clone(),
    ));
    let selector = CandidateSelector::new(
        ledger.clone(),
        gate.clone(),
        book.clone(),
        config.selector(),
    );
    let orchestrator_config = config.orchestrator();
    let dispatcher = Arc::new(LocalDispatcher::new(
        channel.clone(),
        executor.clone(),
        orchestrator_config.executor_agent_id.clone(),
        Duration::from_secs(1),
    ));
    let orchestrator = Arc::new(SwitchOrchestrator::new(
        selector,
        channel.clone(),
        executor.clone(),
        inventory.clone(),
        log.clone(),
        book.clone(),
        orchestrator_config,
    ));
    let sweeper = Arc::new(
        ReconciliationSweeper::new(
            executor,
            inventory.clone(),
            log.clone(),
            ledger.clone(),
            channel.clone(),
            config.sweeper(),
        )
        .with_health_registry(health_registry.clone()),
    );
    let evaluation = Arc::new(evaluate::EvaluationLoop::new(
        orchestrator.clone(),
        inventory.clone(),
        ledger.clone(),
        Duration::from_secs(config.evaluation_interval_secs),
    ));

    // Create shared application state
    let app_state = Arc::new(api::AppState {
        orchestrator,
        channel,
        ledger,
        gate,
        inventory,
        log,
        health_registry: health_registry.clone(),
        metrics,
    });

    // Mark controller as ready after initialization
    health_registry.set_ready(true).await;

    // Worker loops stop on the shutdown broadcast
    let (shutdown_tx, _) = broadcast::channel(1);
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));
    tokio::spawn(dispatcher.run(shutdown_tx.subscribe()));
    tokio::spawn(sweeper.run(shutdown_tx.subscribe()));
    tokio::spawn(evaluation.run(shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
