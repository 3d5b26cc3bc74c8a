//! Embedded command dispatcher
//!
//! An in-process agent that polls its own queue exactly like a remote agent
//! would and applies commands through the `Executor`. Used when the
//! controller itself holds provider credentials, and by tests to exercise
//! the full command path. Keeps an applied-command cache so redelivered
//! commands re-ack the recorded result instead of reapplying the effect.

use crate::channel::CommandChannel;
use crate::exec::{Executor, PoolSpec};
use crate::models::{CommandKind, Heartbeat, Lifecycle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub struct LocalDispatcher {
    channel: Arc<CommandChannel>,
    executor: Arc<dyn Executor>,
    agent_id: String,
    poll_interval: Duration,
    /// Command id -> recorded (success, message); the idempotency cache
    applied: Mutex<HashMap<String, (bool, String)>>,
}

impl LocalDispatcher {
    pub fn new(
        channel: Arc<CommandChannel>,
        executor: Arc<dyn Executor>,
        agent_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            channel,
            executor,
            agent_id: agent_id.into(),
            poll_interval,
            applied: Mutex::new(HashMap::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Poll-and-execute loop; runs until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            agent_id = %self.agent_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting embedded dispatcher"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.recv() => {
                    info!(agent_id = %self.agent_id, "Shutting down embedded dispatcher");
                    break;
                }
            }
        }
    }

    /// One heartbeat cycle: report in, pull pending commands, execute each
    pub async fn poll_once(&self) {
        let heartbeat = Heartbeat {
            agent_id: self.agent_id.clone(),
            resource_id: format!("controller/{}", self.agent_id),
            lifecycle: Lifecycle::Stable,
            interruption: None,
        };
        let commands = self.channel.handle_heartbeat(heartbeat);
        for command in commands {
            self.execute(&command.id, &command.kind).await;
        }
    }

    async fn execute(&self, command_id: &str, kind: &CommandKind) {
        // Redelivery of an already-applied command must not reapply it
        {
            let applied = self.applied.lock().await;
            if let Some((success, message)) = applied.get(command_id) {
                debug!(command_id = %command_id, "Command already applied, re-acking");
                let _ = self.channel.ack(command_id, *success, message);
                return;
            }
        }

        let (success, message) = match kind {
            CommandKind::Provision {
                pool,
                lifecycle,
                tenant_id,
            } => {
                let spec = PoolSpec {
                    pool: pool.clone(),
                    lifecycle: *lifecycle,
                    tenant_id: tenant_id.clone(),
                };
                match self.executor.launch(&spec).await {
                    Ok(resource_id) => (true, resource_id),
                    Err(err) => (false, err.to_string()),
                }
            }
            CommandKind::Terminate { resource_id } => {
                match self.executor.terminate(resource_id).await {
                    Ok(()) => (true, format!("terminate requested for {resource_id}")),
                    Err(err) => (false, err.to_string()),
                }
            }
            CommandKind::PrepareShutdown {
                resource_id,
                grace_secs,
            } => {
                // The embedded agent has no local workload to drain; remote
                // agents stop accepting work here
                (
                    true,
                    format!("shutdown prepared for {resource_id} (grace {grace_secs}s)"),
                )
            }
            CommandKind::CordonNode { node_id } => match self.executor.cordon(node_id).await {
                Ok(()) => (true, format!("cordoned {node_id}")),
                Err(err) => (false, err.to_string()),
            },
        };

        if !success {
            warn!(command_id = %command_id, message = %message, "Command execution failed");
        }

        self.applied
            .lock()
            .await
            .insert(command_id.to_string(), (success, message.clone()));
        if let Err(err) = self.channel.ack(command_id, success, &message) {
            warn!(command_id = %command_id, error = %err, "Failed to ack command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::exec::MockExecutor;
    use crate::models::Pool;
    use crate::risk::RiskLedger;
    use crate::store::Inventory;

    fn setup() -> (Arc<CommandChannel>, Arc<MockExecutor>, Arc<LocalDispatcher>) {
        let channel = Arc::new(CommandChannel::new(
            ChannelConfig {
                heartbeat_interval: Duration::from_millis(10),
                visibility_timeout: Duration::from_millis(20),
                max_delivery_attempts: 5,
                ack_wait: Duration::from_millis(500),
            },
            Arc::new(RiskLedger::new()),
            Arc::new(Inventory::new()),
        ));
        let executor = Arc::new(MockExecutor::new());
        let dispatcher = Arc::new(LocalDispatcher::new(
            channel.clone(),
            executor.clone(),
            "embedded-executor",
            Duration::from_millis(10),
        ));
        (channel, executor, dispatcher)
    }

    #[tokio::test]
    async fn test_executes_provision_and_acks_resource_id() {
        let (channel, executor, dispatcher) = setup();
        let command = channel.enqueue(
            "embedded-executor",
            CommandKind::Provision {
                pool: Pool::new("us-east-1", "us-east-1a", "m5.large"),
                lifecycle: Lifecycle::Interruptible,
                tenant_id: "tenant-a".into(),
            },
        );

        dispatcher.poll_once().await;

        let acked = channel.result(&command.id).unwrap();
        assert_eq!(acked.success, Some(true));
        let resource_id = acked.result_message.unwrap();
        assert_eq!(executor.launched().len(), 1);
        assert_eq!(executor.launched()[0].0, resource_id);
    }

    #[tokio::test]
    async fn test_redelivered_command_not_reapplied() {
        let (channel, executor, dispatcher) = setup();
        channel.enqueue(
            "embedded-executor",
            CommandKind::Provision {
                pool: Pool::new("us-east-1", "us-east-1a", "m5.large"),
                lifecycle: Lifecycle::Interruptible,
                tenant_id: "tenant-a".into(),
            },
        );

        dispatcher.poll_once().await;
        // Past the visibility window the queue would redeliver un-acked
        // commands; simulate a duplicate delivery directly
        let pending = channel.poll_commands("embedded-executor");
        for command in &pending {
            dispatcher.execute(&command.id, &command.kind).await;
        }

        // Exactly one launch happened regardless of redelivery
        assert_eq!(executor.launched().len(), 1);
    }
}
