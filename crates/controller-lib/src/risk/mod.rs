//! Global risk intelligence ledger
//!
//! Shared across every tenant: one tenant's observed interruption protects
//! all others from the same pool for a bounded window (herd immunity). The
//! ledger keeps two representations that answer the same logical question:
//! the mutable poison map for fast safety reads, and the append-only event
//! log for write-heavy, history-preserving ingestion.

mod events;
mod ledger;

pub use events::{RiskEvent, RiskEventLog};
pub use ledger::{PoisonEntry, PoisonMap, POISON_TTL};

use crate::models::{EnvironmentType, InterruptionKind, Pool};
use std::time::Duration;
use tracing::{debug, info};

/// Facade over both ledger forms
pub struct RiskLedger {
    poisons: PoisonMap,
    events: RiskEventLog,
}

impl Default for RiskLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskLedger {
    pub fn new() -> Self {
        Self {
            poisons: PoisonMap::new(),
            events: RiskEventLog::new(),
        }
    }

    /// Override the poison TTL on both forms; tests use short windows
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            poisons: PoisonMap::with_ttl(ttl),
            events: RiskEventLog::with_ttl(ttl),
        }
    }

    /// Gatekeeper for interruption ingestion.
    ///
    /// Lab and experimental interruptions are intentionally dropped before
    /// they reach the ledger; experimental noise must never poison a resource
    /// shared by every tenant.
    pub fn handle_interruption_signal(
        &self,
        pool: &Pool,
        resource_id: &str,
        tenant_id: &str,
        environment: EnvironmentType,
        kind: InterruptionKind,
    ) {
        if environment != EnvironmentType::Production {
            debug!(
                pool = %pool,
                resource_id = %resource_id,
                tenant = %tenant_id,
                "Ignoring non-production interruption signal"
            );
            return;
        }

        info!(
            pool = %pool,
            resource_id = %resource_id,
            tenant = %tenant_id,
            kind = ?kind,
            "Production interruption observed"
        );
        self.poisons.mark_poisoned(pool, tenant_id);
        self.events
            .register_event(pool, kind, tenant_id, Some(resource_id.to_string()));
    }

    pub fn mark_poisoned(&self, pool: &Pool, triggering_tenant: &str) {
        self.poisons.mark_poisoned(pool, triggering_tenant);
    }

    pub fn is_poisoned(&self, pool: &Pool) -> bool {
        self.poisons.is_poisoned(pool)
    }

    pub fn register_event(
        &self,
        pool: &Pool,
        kind: InterruptionKind,
        source_tenant: &str,
        metadata: Option<String>,
    ) -> RiskEvent {
        self.events.register_event(pool, kind, source_tenant, metadata)
    }

    pub fn is_safe(&self, pool: &Pool) -> (bool, Vec<RiskEvent>) {
        self.events.is_safe(pool)
    }

    /// Operator override: clears the pool from both forms so `is_poisoned`
    /// and `is_safe` keep agreeing afterwards
    pub fn force_expire(&self, pool: &Pool) -> bool {
        let flag_cleared = self.poisons.force_expire(pool);
        let events_dropped = self.events.expire_pool(pool);
        flag_cleared || events_dropped > 0
    }

    /// Sweep both forms; returns (expired poison flags, expired events)
    pub fn purge_expired(&self) -> (usize, usize) {
        (self.poisons.purge_expired(), self.events.purge_expired())
    }

    pub fn snapshot(&self) -> Vec<PoisonEntry> {
        self.poisons.snapshot()
    }

    pub fn poisoned_pool_count(&self) -> usize {
        self.poisons.len()
    }
}
