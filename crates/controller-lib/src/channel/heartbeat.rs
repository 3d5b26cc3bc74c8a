//! Agent registry: who is heartbeating, and who went silent

use crate::models::{Heartbeat, Lifecycle};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Last known state of an execution agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub resource_id: String,
    pub lifecycle: Lifecycle,
    pub last_seen: i64,
    pub online: bool,
}

/// Concurrent map of agents keyed by agent id
pub struct AgentRegistry {
    agents: DashMap<String, AgentRecord>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Record a heartbeat; a silent agent coming back is marked online again
    pub fn observe(&self, heartbeat: &Heartbeat) {
        let record = AgentRecord {
            agent_id: heartbeat.agent_id.clone(),
            resource_id: heartbeat.resource_id.clone(),
            lifecycle: heartbeat.lifecycle,
            last_seen: Utc::now().timestamp_millis(),
            online: true,
        };
        if let Some(previous) = self.agents.insert(heartbeat.agent_id.clone(), record) {
            if !previous.online {
                debug!(agent_id = %heartbeat.agent_id, "Agent back online");
            }
        }
    }

    /// The agent currently heartbeating for a resource
    pub fn agent_for_resource(&self, resource_id: &str) -> Option<String> {
        self.agents
            .iter()
            .find(|a| a.resource_id == resource_id && a.online)
            .map(|a| a.agent_id.clone())
    }

    /// Mark agents silent for longer than `threshold` offline.
    /// Returns the ids that newly transitioned.
    pub fn mark_stale_offline(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now().timestamp_millis() - threshold.as_millis() as i64;
        let mut newly_offline = Vec::new();
        for mut agent in self.agents.iter_mut() {
            if agent.online && agent.last_seen < cutoff {
                agent.online = false;
                warn!(
                    agent_id = %agent.agent_id,
                    resource_id = %agent.resource_id,
                    "Agent missed heartbeats, marking offline"
                );
                newly_offline.push(agent.agent_id.clone());
            }
        }
        newly_offline
    }

    pub fn is_online(&self, agent_id: &str) -> bool {
        self.agents.get(agent_id).map(|a| a.online).unwrap_or(false)
    }

    pub fn online_count(&self) -> usize {
        self.agents.iter().filter(|a| a.online).count()
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        self.agents.iter().map(|a| a.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(agent_id: &str, resource_id: &str) -> Heartbeat {
        Heartbeat {
            agent_id: agent_id.into(),
            resource_id: resource_id.into(),
            lifecycle: Lifecycle::Interruptible,
            interruption: None,
        }
    }

    #[test]
    fn test_observe_and_lookup() {
        let registry = AgentRegistry::new();
        registry.observe(&heartbeat("agent-1", "i-1"));

        assert!(registry.is_online("agent-1"));
        assert_eq!(
            registry.agent_for_resource("i-1").as_deref(),
            Some("agent-1")
        );
        assert_eq!(registry.online_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_agent_goes_offline_and_recovers() {
        let registry = AgentRegistry::new();
        registry.observe(&heartbeat("agent-1", "i-1"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let offline = registry.mark_stale_offline(Duration::from_millis(10));
        assert_eq!(offline, vec!["agent-1".to_string()]);
        assert!(!registry.is_online("agent-1"));
        assert!(registry.agent_for_resource("i-1").is_none());

        // Second sweep does not re-report
        assert!(registry
            .mark_stale_offline(Duration::from_millis(10))
            .is_empty());

        registry.observe(&heartbeat("agent-1", "i-1"));
        assert!(registry.is_online("agent-1"));
    }
}
