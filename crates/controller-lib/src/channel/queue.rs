//! Per-agent command queue with at-least-once delivery
//!
//! Commands stay queued until acknowledged. A poll stamps a visibility
//! deadline; a command whose ack never arrives becomes visible again and is
//! redelivered, up to a bounded attempt budget, after which it is
//! dead-lettered for operator attention. Acks are idempotent by command id:
//! the first ack records the result, later acks for the same id return the
//! recorded result and apply nothing.

use crate::error::{CoreError, Result};
use crate::models::{Command, CommandKind};
use crate::observability::ControllerMetrics;
use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Command channel tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Agent poll interval; heartbeats default to every 30s
    pub heartbeat_interval: Duration,
    /// How long a delivered command stays invisible before redelivery.
    /// Defaults to 3x the heartbeat interval, matching the sweeper's
    /// offline threshold.
    pub visibility_timeout: Duration,
    /// Deliveries before a command is dead-lettered
    pub max_delivery_attempts: u32,
    /// Default bound on waiting for an ack
    pub ack_wait: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(90),
            max_delivery_attempts: 5,
            ack_wait: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    command: Command,
    delivery_attempts: u32,
    /// Millisecond timestamp before which this command is not redelivered
    visible_at: i64,
}

/// Queue state shared between the controller and the agent protocol
pub struct CommandQueue {
    queues: DashMap<String, Vec<QueuedCommand>>,
    /// Acked commands by id; the idempotency record
    completed: DashMap<String, Command>,
    /// Commands that exhausted their delivery budget
    dead: DashMap<String, Command>,
    /// Command id -> target agent id
    index: DashMap<String, String>,
    config: ChannelConfig,
    metrics: ControllerMetrics,
}

impl CommandQueue {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            queues: DashMap::new(),
            completed: DashMap::new(),
            dead: DashMap::new(),
            index: DashMap::new(),
            config,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Append a command to an agent's queue
    pub fn enqueue(&self, target_agent_id: &str, kind: CommandKind) -> Command {
        let command = Command {
            id: uuid::Uuid::new_v4().to_string(),
            target_agent_id: target_agent_id.to_string(),
            kind,
            created_at: Utc::now().timestamp(),
            executed_at: None,
            success: None,
            result_message: None,
        };
        self.index
            .insert(command.id.clone(), target_agent_id.to_string());
        self.queues
            .entry(target_agent_id.to_string())
            .or_default()
            .push(QueuedCommand {
                command: command.clone(),
                delivery_attempts: 0,
                visible_at: 0,
            });
        debug!(
            command_id = %command.id,
            agent_id = %target_agent_id,
            "Command enqueued"
        );
        command
    }

    /// Commands currently deliverable to an agent.
    ///
    /// Each returned command gets a fresh visibility deadline; commands past
    /// their delivery budget move to the dead-letter set instead.
    pub fn poll(&self, agent_id: &str) -> Vec<Command> {
        let now_ms = Utc::now().timestamp_millis();
        let visibility_ms = self.config.visibility_timeout.as_millis() as i64;
        let mut delivered = Vec::new();

        if let Some(mut queue) = self.queues.get_mut(agent_id) {
            let mut kept = Vec::with_capacity(queue.len());
            for mut queued in queue.drain(..) {
                if queued.visible_at > now_ms {
                    kept.push(queued);
                    continue;
                }
                if queued.delivery_attempts >= self.config.max_delivery_attempts {
                    warn!(
                        command_id = %queued.command.id,
                        agent_id = %agent_id,
                        attempts = queued.delivery_attempts,
                        "Command exhausted delivery budget, dead-lettering"
                    );
                    self.dead
                        .insert(queued.command.id.clone(), queued.command);
                    self.metrics.inc_commands_dead_lettered();
                    continue;
                }
                queued.delivery_attempts += 1;
                queued.visible_at = now_ms + visibility_ms;
                delivered.push(queued.command.clone());
                kept.push(queued);
            }
            *queue = kept;
        }
        delivered
    }

    /// Record a command result. Idempotent: re-acking an already-executed
    /// command returns the recorded result without reapplying anything.
    pub fn ack(&self, command_id: &str, success: bool, message: &str) -> Result<Command> {
        if let Some(existing) = self.completed.get(command_id) {
            debug!(command_id = %command_id, "Duplicate ack, returning recorded result");
            return Ok(existing.clone());
        }

        let agent_id = self
            .index
            .get(command_id)
            .map(|a| a.clone())
            .ok_or_else(|| CoreError::NotFound(format!("command {command_id}")))?;

        let mut command = None;
        if let Some(mut queue) = self.queues.get_mut(&agent_id) {
            if let Some(pos) = queue.iter().position(|q| q.command.id == command_id) {
                command = Some(queue.remove(pos).command);
            }
        }
        // A dead-lettered command may still be acked by a slow agent
        let mut command = match command {
            Some(c) => c,
            None => self
                .dead
                .remove(command_id)
                .map(|(_, c)| c)
                .ok_or_else(|| CoreError::NotFound(format!("command {command_id}")))?,
        };

        command.executed_at = Some(Utc::now().timestamp());
        command.success = Some(success);
        command.result_message = Some(message.to_string());
        self.completed
            .insert(command_id.to_string(), command.clone());
        Ok(command)
    }

    /// Recorded result for an acked command
    pub fn result(&self, command_id: &str) -> Option<Command> {
        self.completed.get(command_id).map(|c| c.clone())
    }

    /// Wait for a command's ack up to `timeout`.
    ///
    /// Redelivery happens independently through the visibility timeout; this
    /// only observes completion.
    pub async fn wait_for_ack(&self, command_id: &str, timeout: Duration) -> Result<Command> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(command) = self.result(command_id) {
                return Ok(command);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Timeout {
                    operation: format!("ack of command {command_id}"),
                    waited_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn pending_count(&self, agent_id: &str) -> usize {
        self.queues.get(agent_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn dead_letters(&self) -> Vec<Command> {
        self.dead.iter().map(|c| c.clone()).collect()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_config() -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_millis(20),
            max_delivery_attempts: 2,
            ack_wait: Duration::from_millis(200),
        }
    }

    fn terminate_kind() -> CommandKind {
        CommandKind::Terminate {
            resource_id: "i-1".into(),
        }
    }

    #[test]
    fn test_poll_delivers_then_hides() {
        let queue = CommandQueue::new(short_config());
        let cmd = queue.enqueue("agent-1", terminate_kind());

        let first = queue.poll("agent-1");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, cmd.id);

        // Within the visibility window nothing is redelivered
        assert!(queue.poll("agent-1").is_empty());
    }

    #[tokio::test]
    async fn test_unacked_command_redelivered() {
        let queue = CommandQueue::new(short_config());
        let cmd = queue.enqueue("agent-1", terminate_kind());

        assert_eq!(queue.poll("agent-1").len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let redelivered = queue.poll("agent-1");
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, cmd.id);
    }

    fn dead_lettered_total() -> f64 {
        prometheus::gather()
            .iter()
            .find(|family| family.get_name() == "fleet_controller_commands_dead_lettered_total")
            .map(|family| family.get_metric()[0].get_counter().get_value())
            .unwrap_or(0.0)
    }

    #[tokio::test]
    async fn test_exhausted_command_dead_lettered() {
        let queue = CommandQueue::new(short_config());
        let before = dead_lettered_total();
        queue.enqueue("agent-1", terminate_kind());

        for _ in 0..2 {
            assert_eq!(queue.poll("agent-1").len(), 1);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        // Third poll hits the attempt budget
        assert!(queue.poll("agent-1").is_empty());
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.pending_count("agent-1"), 0);
        // The counter moves with the dead-letter set
        assert!(dead_lettered_total() >= before + 1.0);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let queue = CommandQueue::new(short_config());
        let cmd = queue.enqueue("agent-1", terminate_kind());
        queue.poll("agent-1");

        let first = queue.ack(&cmd.id, true, "terminated").unwrap();
        assert_eq!(first.success, Some(true));
        assert_eq!(first.result_message.as_deref(), Some("terminated"));

        // Replay reports the same recorded result, even with a different body
        let replay = queue.ack(&cmd.id, false, "something else").unwrap();
        assert_eq!(replay.success, Some(true));
        assert_eq!(replay.result_message.as_deref(), Some("terminated"));
    }

    #[test]
    fn test_ack_unknown_command() {
        let queue = CommandQueue::new(short_config());
        let err = queue.ack("ghost", true, "done").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_wait_for_ack() {
        let queue = std::sync::Arc::new(CommandQueue::new(short_config()));
        let cmd = queue.enqueue("agent-1", terminate_kind());
        queue.poll("agent-1");

        let waiter = {
            let queue = queue.clone();
            let id = cmd.id.clone();
            tokio::spawn(async move { queue.wait_for_ack(&id, Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.ack(&cmd.id, true, "ok").unwrap();

        let acked = waiter.await.unwrap().unwrap();
        assert_eq!(acked.success, Some(true));
    }

    #[tokio::test]
    async fn test_wait_for_ack_times_out() {
        let queue = CommandQueue::new(short_config());
        let cmd = queue.enqueue("agent-1", terminate_kind());
        let err = queue
            .wait_for_ack(&cmd.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}
