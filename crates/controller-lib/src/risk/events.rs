//! Append-only event form of the risk ledger
//!
//! Events are pure O(1) inserts on the heartbeat ingestion hot path; they are
//! never updated. Safety is computed at read time: a pool is safe when it has
//! no event with `expires_at` in the future. This form preserves the full
//! interruption history; the mutable poison map is the compatibility layer.

use crate::models::{InterruptionKind, Pool};
use crate::risk::ledger::POISON_TTL;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One recorded interruption event for a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub pool: Pool,
    pub kind: InterruptionKind,
    pub reported_at: i64,
    pub expires_at: i64,
    pub source_tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Append-only interruption event log, indexed by pool
pub struct RiskEventLog {
    events: DashMap<Pool, Vec<RiskEvent>>,
    ttl_secs: i64,
}

impl Default for RiskEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskEventLog {
    pub fn new() -> Self {
        Self::with_ttl(POISON_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            events: DashMap::new(),
            ttl_secs: ttl.as_secs() as i64,
        }
    }

    /// Insert an event. Never queries existing rows.
    pub fn register_event(
        &self,
        pool: &Pool,
        kind: InterruptionKind,
        source_tenant: &str,
        metadata: Option<String>,
    ) -> RiskEvent {
        let now = Utc::now().timestamp();
        let event = RiskEvent {
            pool: pool.clone(),
            kind,
            reported_at: now,
            expires_at: now + self.ttl_secs,
            source_tenant_id: source_tenant.to_string(),
            metadata,
        };
        self.events
            .entry(pool.clone())
            .or_default()
            .push(event.clone());
        event
    }

    /// Safety check: `(true, [])` when no unexpired event exists for the pool
    pub fn is_safe(&self, pool: &Pool) -> (bool, Vec<RiskEvent>) {
        let now = Utc::now().timestamp();
        let active: Vec<RiskEvent> = self
            .events
            .get(pool)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|e| e.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        (active.is_empty(), active)
    }

    /// Drop every event for a pool (operator override); returns how many
    /// were removed
    pub fn expire_pool(&self, pool: &Pool) -> usize {
        self.events
            .remove(pool)
            .map(|(_, events)| events.len())
            .unwrap_or(0)
    }

    /// Drop expired events; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut removed = 0;
        for mut entry in self.events.iter_mut() {
            let before = entry.len();
            entry.retain(|e| e.expires_at > now);
            removed += before - entry.len();
        }
        self.events.retain(|_, events| !events.is_empty());
        removed
    }

    pub fn event_count(&self) -> usize {
        self.events.iter().map(|e| e.len()).sum()
    }
}
