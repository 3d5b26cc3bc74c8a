//! Command channel: asynchronous controller-to-agent coordination
//!
//! Agents poll on each heartbeat instead of holding inbound connections,
//! which keeps agents behind NAT and firewalls reachable. Delivery is
//! at-least-once with idempotent acknowledgment; heartbeats double as the
//! ingestion path for interruption signals.

mod dispatcher;
mod heartbeat;
mod queue;

pub use dispatcher::LocalDispatcher;
pub use heartbeat::{AgentRecord, AgentRegistry};
pub use queue::{ChannelConfig, CommandQueue};

use crate::error::Result;
use crate::models::{Command, CommandKind, EnvironmentType, Heartbeat};
use crate::risk::RiskLedger;
use crate::store::Inventory;
use std::sync::Arc;
use std::time::Duration;

/// Facade over the queue, the agent registry, and signal ingestion
pub struct CommandChannel {
    queue: CommandQueue,
    registry: AgentRegistry,
    ledger: Arc<RiskLedger>,
    inventory: Arc<Inventory>,
}

impl CommandChannel {
    pub fn new(config: ChannelConfig, ledger: Arc<RiskLedger>, inventory: Arc<Inventory>) -> Self {
        Self {
            queue: CommandQueue::new(config),
            registry: AgentRegistry::new(),
            ledger,
            inventory,
        }
    }

    /// Ingest a heartbeat and return the agent's pending commands.
    ///
    /// Any carried interruption signal is routed to the risk ledger's
    /// gatekeeper before commands are handed out.
    pub fn handle_heartbeat(&self, heartbeat: Heartbeat) -> Vec<Command> {
        self.registry.observe(&heartbeat);

        if let Some(signal) = &heartbeat.interruption {
            // Unknown resources are treated as production: a signal we cannot
            // attribute still protects the herd
            let (tenant_id, environment) = self
                .inventory
                .get(&signal.resource_id)
                .map(|r| (r.tenant_id, r.environment))
                .unwrap_or_else(|| ("unknown".to_string(), EnvironmentType::Production));
            self.ledger.handle_interruption_signal(
                &signal.pool,
                &signal.resource_id,
                &tenant_id,
                environment,
                signal.kind,
            );
        }

        self.queue.poll(&heartbeat.agent_id)
    }

    pub fn enqueue(&self, target_agent_id: &str, kind: CommandKind) -> Command {
        self.queue.enqueue(target_agent_id, kind)
    }

    /// Enqueue a command and wait for its acknowledgment.
    ///
    /// Redelivery to a slow agent happens transparently through the queue's
    /// visibility timeout; only exhaustion of `timeout` surfaces here.
    pub async fn dispatch_and_wait(
        &self,
        target_agent_id: &str,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<Command> {
        let command = self.queue.enqueue(target_agent_id, kind);
        self.queue.wait_for_ack(&command.id, timeout).await
    }

    pub fn ack(&self, command_id: &str, success: bool, message: &str) -> Result<Command> {
        self.queue.ack(command_id, success, message)
    }

    pub fn result(&self, command_id: &str) -> Option<Command> {
        self.queue.result(command_id)
    }

    /// Deliverable commands for an agent, outside of a heartbeat
    pub fn poll_commands(&self, agent_id: &str) -> Vec<Command> {
        self.queue.poll(agent_id)
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn pending_count(&self) -> usize {
        self.queue.total_pending()
    }

    pub fn dead_letters(&self) -> Vec<Command> {
        self.queue.dead_letters()
    }

    /// The silence threshold after which an agent is considered offline:
    /// 3x the heartbeat interval
    pub fn offline_threshold(&self) -> Duration {
        self.queue.config().heartbeat_interval * 3
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.queue.config().heartbeat_interval
    }

    pub fn ack_wait(&self) -> Duration {
        self.queue.config().ack_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        InterruptionKind, InterruptionSignal, Lifecycle, ManagedResource, Pool,
    };

    fn setup() -> (Arc<RiskLedger>, Arc<Inventory>, CommandChannel) {
        let ledger = Arc::new(RiskLedger::new());
        let inventory = Arc::new(Inventory::new());
        let channel = CommandChannel::new(
            ChannelConfig::default(),
            ledger.clone(),
            inventory.clone(),
        );
        (ledger, inventory, channel)
    }

    fn pool() -> Pool {
        Pool::new("us-east-1", "us-east-1a", "m5.large")
    }

    fn heartbeat_with_signal(resource_id: &str) -> Heartbeat {
        Heartbeat {
            agent_id: "agent-1".into(),
            resource_id: resource_id.into(),
            lifecycle: Lifecycle::Interruptible,
            interruption: Some(InterruptionSignal {
                kind: InterruptionKind::TerminationNotice,
                pool: pool(),
                resource_id: resource_id.into(),
            }),
        }
    }

    #[test]
    fn test_production_signal_poisons_pool() {
        let (ledger, inventory, channel) = setup();
        inventory.register(ManagedResource::new(
            "i-1",
            pool(),
            Lifecycle::Interruptible,
            "tenant-a",
            EnvironmentType::Production,
        ));

        channel.handle_heartbeat(heartbeat_with_signal("i-1"));
        assert!(ledger.is_poisoned(&pool()));
    }

    #[test]
    fn test_lab_signal_does_not_poison() {
        let (ledger, inventory, channel) = setup();
        inventory.register(ManagedResource::new(
            "i-lab",
            pool(),
            Lifecycle::Interruptible,
            "tenant-a",
            EnvironmentType::Lab,
        ));

        channel.handle_heartbeat(heartbeat_with_signal("i-lab"));
        assert!(!ledger.is_poisoned(&pool()));
    }

    #[test]
    fn test_unknown_resource_treated_as_production() {
        let (ledger, _, channel) = setup();
        channel.handle_heartbeat(heartbeat_with_signal("i-mystery"));
        assert!(ledger.is_poisoned(&pool()));
    }

    #[test]
    fn test_heartbeat_returns_pending_commands() {
        let (_, _, channel) = setup();
        channel.enqueue(
            "agent-1",
            CommandKind::Terminate {
                resource_id: "i-1".into(),
            },
        );

        let commands = channel.handle_heartbeat(Heartbeat {
            agent_id: "agent-1".into(),
            resource_id: "i-1".into(),
            lifecycle: Lifecycle::Interruptible,
            interruption: None,
        });
        assert_eq!(commands.len(), 1);
        assert!(channel.registry().is_online("agent-1"));
    }
}
