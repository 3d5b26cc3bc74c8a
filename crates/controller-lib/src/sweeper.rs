//! Reconciliation sweeper: the background loop that closes what the
//! orchestrator could not.
//!
//! Each pass re-checks zombies against the provider (termination is only
//! ever confirmed by a provider read), re-issues terminations within a
//! bounded retry budget, expires stale poison flags, and marks silent
//! agents offline. Zombies that exhaust the budget are flagged for operator
//! attention instead of being retried forever.

use crate::channel::CommandChannel;
use crate::error::Result;
use crate::exec::Executor;
use crate::health::{components, HealthRegistry};
use crate::models::{SwitchOutcome, SwitchPhase};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::risk::RiskLedger;
use crate::store::{Inventory, SwitchLog};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Sweeper tuning
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Delay between reconciliation passes
    pub interval: Duration,
    /// Termination re-issues per zombie before it is flagged for an operator
    pub max_termination_attempts: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_termination_attempts: 5,
        }
    }
}

pub struct ReconciliationSweeper {
    executor: Arc<dyn Executor>,
    inventory: Arc<Inventory>,
    log: Arc<SwitchLog>,
    ledger: Arc<RiskLedger>,
    channel: Arc<CommandChannel>,
    config: SweeperConfig,
    /// Zombie resource id -> termination re-issues so far
    attempts: DashMap<String, u32>,
    /// Zombies past the retry budget, awaiting manual cleanup
    attention: DashMap<String, String>,
    health: Option<HealthRegistry>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl ReconciliationSweeper {
    pub fn new(
        executor: Arc<dyn Executor>,
        inventory: Arc<Inventory>,
        log: Arc<SwitchLog>,
        ledger: Arc<RiskLedger>,
        channel: Arc<CommandChannel>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            executor,
            inventory,
            log,
            ledger,
            channel,
            config,
            attempts: DashMap::new(),
            attention: DashMap::new(),
            health: None,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("sweeper"),
        }
    }

    /// Report sweeper health to the given registry after each pass
    pub fn with_health_registry(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    /// Reconciliation loop; runs until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconciliation sweeper"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconciliation sweeper");
                    break;
                }
            }
        }
    }

    /// One full reconciliation pass
    pub async fn sweep_once(&self) {
        self.reconcile_zombies().await;
        self.expire_risk();
        self.reconcile_agents();
        self.metrics
            .set_pending_commands(self.channel.pending_count() as i64);

        // Zombies stuck past the retry budget degrade the sweeper component
        if let Some(health) = &self.health {
            if self.attention.is_empty() {
                health.set_healthy(components::SWEEPER).await;
            } else {
                health
                    .set_degraded(
                        components::SWEEPER,
                        format!("{} zombies awaiting manual cleanup", self.attention.len()),
                    )
                    .await;
            }
        }
    }

    /// Resources flagged for manual cleanup, with the last failure detail
    pub fn attention_needed(&self) -> Vec<(String, String)> {
        self.attention
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    async fn reconcile_zombies(&self) {
        for zombie in self.inventory.zombies() {
            match self.reconcile_zombie(&zombie.resource_id).await {
                Ok(confirmed) if confirmed => {
                    self.attempts.remove(&zombie.resource_id);
                    self.attention.remove(&zombie.resource_id);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        resource_id = %zombie.resource_id,
                        error = %err,
                        "Zombie reconciliation failed this pass"
                    );
                }
            }
        }
    }

    /// Returns true once the provider confirms the zombie is gone
    async fn reconcile_zombie(&self, resource_id: &str) -> Result<bool> {
        let status = self.executor.describe(resource_id).await?;
        if status.is_gone() {
            self.inventory.confirm_terminated(resource_id)?;
            if let Some(open) = self.log.open_for_source(resource_id) {
                self.log.close(
                    &open,
                    SwitchPhase::Confirmed,
                    SwitchOutcome::Success,
                    "source termination confirmed by provider",
                );
            }
            info!(resource_id = %resource_id, "Zombie resolved, provider confirmed deletion");
            return Ok(true);
        }

        let attempt = {
            let mut entry = self.attempts.entry(resource_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt > self.config.max_termination_attempts {
            let detail = format!(
                "still {status:?} after {} termination attempts",
                self.config.max_termination_attempts
            );
            self.logger.log_operator_attention(resource_id, &detail);
            self.attention.insert(resource_id.to_string(), detail);
            return Ok(false);
        }

        debug!(
            resource_id = %resource_id,
            attempt,
            status = ?status,
            "Zombie still present, re-issuing termination"
        );
        self.executor.terminate(resource_id).await?;
        Ok(false)
    }

    fn expire_risk(&self) {
        let (expired_flags, expired_events) = self.ledger.purge_expired();
        if expired_flags > 0 || expired_events > 0 {
            info!(
                expired_flags,
                expired_events, "Expired stale risk ledger entries"
            );
        }
        self.metrics
            .set_poisoned_pools(self.ledger.poisoned_pool_count() as i64);
    }

    fn reconcile_agents(&self) {
        let newly_offline = self
            .channel
            .registry()
            .mark_stale_offline(self.channel.offline_threshold());
        for agent_id in &newly_offline {
            warn!(agent_id = %agent_id, "Agent went silent past the offline threshold");
        }
        self.metrics
            .set_agents_online(self.channel.registry().online_count() as i64);
    }
}
