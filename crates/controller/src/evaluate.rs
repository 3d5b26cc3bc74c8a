//! Periodic fleet evaluation
//!
//! Scans the inventory on an interval and initiates switches for running
//! interruptible resources whose pool has become poisoned. The drain
//! variant follows the resource's kind, so a Kubernetes node picked up
//! here is cordoned and drained like any operator-triggered switch.
//! Conflicts are expected (an operator or a previous pass may already be
//! switching the resource) and skipped quietly.

use controller_lib::{
    Constraints, CoreError, Inventory, Lifecycle, ResourceStatus, RiskLedger, SwitchOrchestrator,
    SwitchRequest, SwitchVariant,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct EvaluationLoop {
    orchestrator: Arc<SwitchOrchestrator>,
    inventory: Arc<Inventory>,
    ledger: Arc<RiskLedger>,
    interval: Duration,
}

impl EvaluationLoop {
    pub fn new(
        orchestrator: Arc<SwitchOrchestrator>,
        inventory: Arc<Inventory>,
        ledger: Arc<RiskLedger>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            inventory,
            ledger,
            interval,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting evaluation loop"
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down evaluation loop");
                    break;
                }
            }
        }
    }

    /// One pass: switch every running interruptible resource sitting in a
    /// poisoned pool
    pub async fn evaluate_once(&self) {
        for resource in self.inventory.list() {
            if resource.status != ResourceStatus::Running
                || resource.lifecycle != Lifecycle::Interruptible
                || !self.ledger.is_poisoned(&resource.pool)
            {
                continue;
            }
            info!(
                resource_id = %resource.resource_id,
                pool = %resource.pool,
                "Resource sits in a poisoned pool, initiating switch"
            );
            let request = SwitchRequest {
                source_resource_id: resource.resource_id.clone(),
                constraints: Constraints::default(),
                variant: SwitchVariant::for_kind(resource.kind),
                reason: Some(format!("pool {} is poisoned", resource.pool)),
            };
            match self.orchestrator.run_switch(&request).await {
                Ok(record) => {
                    info!(
                        record_id = %record.record_id,
                        outcome = ?record.outcome,
                        "Evaluation-initiated switch finished"
                    );
                }
                Err(CoreError::Conflict(_)) => {
                    // Already being handled; the next pass re-checks
                }
                Err(err) => {
                    warn!(
                        resource_id = %resource.resource_id,
                        error = %err,
                        "Evaluation-initiated switch failed to start"
                    );
                }
            }
        }
    }
}
