//! Mutable poison-flag form of the risk ledger
//!
//! One atomically-upserted entry per pool. Poisoning is a rolling window:
//! repeat interruptions refresh the expiry rather than extending it
//! cumulatively. Expired entries are cleared lazily on read, so no manual
//! intervention is ever required for a pool to become safe again.

use crate::models::Pool;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// How long a pool stays poisoned after an observed interruption (15 days)
pub const POISON_TTL: Duration = Duration::from_secs(15 * 24 * 60 * 60);

/// Poison state for a single pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonEntry {
    pub pool: Pool,
    pub poisoned: bool,
    pub interruption_count: u32,
    pub poisoned_at: i64,
    pub poison_expires_at: i64,
    pub triggering_tenant_id: String,
}

/// Concurrent map of pool poison flags.
///
/// All updates go through the dashmap entry API as a single atomic map
/// operation; there is no read-then-write window for concurrent writers from
/// different tenants to race on. Writes are commutative within the TTL
/// window, so no global ordering is required.
pub struct PoisonMap {
    entries: DashMap<Pool, PoisonEntry>,
    ttl_secs: i64,
}

impl Default for PoisonMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PoisonMap {
    pub fn new() -> Self {
        Self::with_ttl(POISON_TTL)
    }

    /// Override the poison TTL; tests use short windows
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_secs: ttl.as_secs() as i64,
        }
    }

    /// Upsert the poison flag for a pool.
    ///
    /// Repeat calls for an already-poisoned pool increment the interruption
    /// count and refresh the expiry.
    pub fn mark_poisoned(&self, pool: &Pool, triggering_tenant: &str) {
        let now = Utc::now().timestamp();
        let expires = now + self.ttl_secs;

        self.entries
            .entry(pool.clone())
            .and_modify(|entry| {
                if entry.poisoned && entry.poison_expires_at > now {
                    entry.interruption_count += 1;
                } else {
                    // Previous window expired; start a fresh one
                    entry.interruption_count = 1;
                    entry.poisoned_at = now;
                }
                entry.poisoned = true;
                entry.poison_expires_at = expires;
                entry.triggering_tenant_id = triggering_tenant.to_string();
            })
            .or_insert_with(|| PoisonEntry {
                pool: pool.clone(),
                poisoned: true,
                interruption_count: 1,
                poisoned_at: now,
                poison_expires_at: expires,
                triggering_tenant_id: triggering_tenant.to_string(),
            });

        info!(
            pool = %pool,
            tenant = %triggering_tenant,
            expires_at = expires,
            "Pool marked poisoned"
        );
    }

    /// Whether the pool is currently poisoned.
    ///
    /// Expired entries are removed here as a side effect (lazy cleanup).
    /// Durable backends that can fail must fail open at this seam: a storage
    /// error is logged and answered as "not poisoned", because blocking all
    /// optimization on risk-signal availability is the worse outcome.
    pub fn is_poisoned(&self, pool: &Pool) -> bool {
        let now = Utc::now().timestamp();
        self.entries.remove_if(pool, |_, entry| {
            if entry.poison_expires_at <= now {
                debug!(pool = %entry.pool, "Poison window expired, clearing flag");
                true
            } else {
                false
            }
        });
        self.entries
            .get(pool)
            .map(|entry| entry.poisoned)
            .unwrap_or(false)
    }

    /// Operator override: clear a poison flag before its window elapses
    pub fn force_expire(&self, pool: &Pool) -> bool {
        let removed = self.entries.remove(pool).is_some();
        if removed {
            info!(pool = %pool, "Poison flag force-expired by operator");
        }
        removed
    }

    /// Drop all expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.poison_expires_at > now);
        before - self.entries.len()
    }

    /// Snapshot of all live entries (expired ones included until purged)
    pub fn snapshot(&self) -> Vec<PoisonEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
