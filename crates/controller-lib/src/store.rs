//! In-memory state stores: resource inventory and the switch audit log

use crate::error::{CoreError, Result};
use crate::models::{
    ManagedResource, Pool, ResourceStatus, SwitchOutcome, SwitchPhase, SwitchRecord,
};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::RwLock;
use tracing::info;

/// Tenant-scoped registry of managed resources, keyed by provider id
pub struct Inventory {
    resources: DashMap<String, ManagedResource>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
        }
    }

    pub fn register(&self, resource: ManagedResource) {
        self.resources
            .insert(resource.resource_id.clone(), resource);
    }

    pub fn get(&self, resource_id: &str) -> Option<ManagedResource> {
        self.resources.get(resource_id).map(|r| r.clone())
    }

    pub fn set_status(&self, resource_id: &str, status: ResourceStatus) -> Result<()> {
        let mut entry = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| CoreError::NotFound(format!("resource {resource_id}")))?;
        entry.status = status;
        Ok(())
    }

    /// Transition to `ZombieTerminating` and stamp the termination attempt.
    /// The resource stays a zombie until the provider confirms deletion.
    pub fn mark_zombie(&self, resource_id: &str) -> Result<()> {
        let mut entry = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| CoreError::NotFound(format!("resource {resource_id}")))?;
        entry.status = ResourceStatus::ZombieTerminating;
        entry.termination_attempted_at = Some(Utc::now().timestamp());
        Ok(())
    }

    /// Provider-confirmed deletion: the only path to `Terminated`
    pub fn confirm_terminated(&self, resource_id: &str) -> Result<()> {
        let mut entry = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| CoreError::NotFound(format!("resource {resource_id}")))?;
        entry.status = ResourceStatus::Terminated;
        entry.termination_confirmed = true;
        info!(resource_id = %resource_id, "Termination confirmed by provider");
        Ok(())
    }

    pub fn list(&self) -> Vec<ManagedResource> {
        self.resources.iter().map(|r| r.clone()).collect()
    }

    pub fn zombies(&self) -> Vec<ManagedResource> {
        self.resources
            .iter()
            .filter(|r| r.status == ResourceStatus::ZombieTerminating)
            .map(|r| r.clone())
            .collect()
    }

    pub fn in_pool(&self, pool: &Pool) -> Vec<ManagedResource> {
        self.resources
            .iter()
            .filter(|r| &r.pool == pool)
            .map(|r| r.clone())
            .collect()
    }
}

/// Append-only log of switch attempts.
///
/// A record id gets one opening row and one closing row; rows are never
/// mutated after they are appended.
pub struct SwitchLog {
    rows: RwLock<Vec<SwitchRecord>>,
}

impl Default for SwitchLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchLog {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }

    /// Append the opening row for a new switch attempt
    pub fn open(&self, source_resource_id: &str, tenant_id: &str) -> SwitchRecord {
        let record = SwitchRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            source_resource_id: source_resource_id.to_string(),
            tenant_id: tenant_id.to_string(),
            chosen_pool: None,
            replacement_resource_id: None,
            phase_reached: SwitchPhase::Initiated,
            outcome: None,
            reason: None,
            cost_delta: None,
            drain_timed_out: false,
            created_at: Utc::now().timestamp(),
            closed_at: None,
        };
        self.rows
            .write()
            .expect("switch log poisoned")
            .push(record.clone());
        record
    }

    /// Append the closing row for a record at a terminal transition.
    /// Non-phase fields (chosen pool, replacement id, cost delta, drain
    /// flag) are taken from `base`, the caller's working copy.
    pub fn close(
        &self,
        base: &SwitchRecord,
        phase: SwitchPhase,
        outcome: SwitchOutcome,
        reason: impl Into<String>,
    ) -> SwitchRecord {
        let closed = SwitchRecord {
            phase_reached: phase,
            outcome: Some(outcome),
            reason: Some(reason.into()),
            closed_at: Some(Utc::now().timestamp()),
            ..base.clone()
        };
        self.rows
            .write()
            .expect("switch log poisoned")
            .push(closed.clone());
        closed
    }

    /// Append a non-terminal progress row, e.g. when a switch hands off to
    /// the sweeper for provider confirmation
    pub fn append_progress(&self, base: &SwitchRecord, phase: SwitchPhase) -> SwitchRecord {
        let row = SwitchRecord {
            phase_reached: phase,
            outcome: None,
            closed_at: None,
            ..base.clone()
        };
        self.rows
            .write()
            .expect("switch log poisoned")
            .push(row.clone());
        row
    }

    /// Latest row of the newest non-terminal record for a source resource
    pub fn open_for_source(&self, source_resource_id: &str) -> Option<SwitchRecord> {
        self.open_records()
            .into_iter()
            .find(|r| r.source_resource_id == source_resource_id)
    }

    /// Latest row for a record id
    pub fn latest(&self, record_id: &str) -> Option<SwitchRecord> {
        self.rows
            .read()
            .expect("switch log poisoned")
            .iter()
            .rev()
            .find(|r| r.record_id == record_id)
            .cloned()
    }

    /// Latest row per record, newest first
    pub fn list(&self) -> Vec<SwitchRecord> {
        let rows = self.rows.read().expect("switch log poisoned");
        let mut latest: Vec<SwitchRecord> = Vec::new();
        for row in rows.iter().rev() {
            if !latest.iter().any(|r| r.record_id == row.record_id) {
                latest.push(row.clone());
            }
        }
        latest
    }

    /// Records without a terminal row, i.e. switches still in flight
    pub fn open_records(&self) -> Vec<SwitchRecord> {
        self.list()
            .into_iter()
            .filter(|r| !r.phase_reached.is_terminal())
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().expect("switch log poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnvironmentType, Lifecycle};

    fn resource(id: &str) -> ManagedResource {
        ManagedResource::new(
            id,
            Pool::new("us-east-1", "us-east-1a", "m5.large"),
            Lifecycle::Interruptible,
            "tenant-a",
            EnvironmentType::Production,
        )
    }

    #[test]
    fn test_zombie_then_confirm() {
        let inventory = Inventory::new();
        inventory.register(resource("i-1"));

        inventory.mark_zombie("i-1").unwrap();
        let zombie = inventory.get("i-1").unwrap();
        assert_eq!(zombie.status, ResourceStatus::ZombieTerminating);
        assert!(zombie.termination_attempted_at.is_some());
        assert!(!zombie.termination_confirmed);

        inventory.confirm_terminated("i-1").unwrap();
        let done = inventory.get("i-1").unwrap();
        assert_eq!(done.status, ResourceStatus::Terminated);
        assert!(done.termination_confirmed);
    }

    #[test]
    fn test_switch_log_appends_not_mutates() {
        let log = SwitchLog::new();
        let open = log.open("i-1", "tenant-a");
        assert_eq!(log.row_count(), 1);

        let closed = log.close(&open, SwitchPhase::Failed, SwitchOutcome::Failed, "no candidate");
        // Closing appended a second row instead of mutating the first
        assert_eq!(log.row_count(), 2);
        assert_eq!(closed.record_id, open.record_id);
        assert_eq!(
            log.latest(&open.record_id).unwrap().phase_reached,
            SwitchPhase::Failed
        );
    }

    #[test]
    fn test_open_records_excludes_terminal() {
        let log = SwitchLog::new();
        let a = log.open("i-1", "tenant-a");
        let _b = log.open("i-2", "tenant-a");
        log.close(&a, SwitchPhase::Confirmed, SwitchOutcome::Success, "done");

        let open = log.open_records();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].source_resource_id, "i-2");
        assert!(log.open_for_source("i-1").is_none());
        assert!(log.open_for_source("i-2").is_some());
    }

    #[test]
    fn test_progress_row_keeps_record_open() {
        let log = SwitchLog::new();
        let mut working = log.open("i-1", "tenant-a");
        working.replacement_resource_id = Some("i-2".into());
        log.append_progress(&working, SwitchPhase::SourceDecommissioning);

        let latest = log.open_for_source("i-1").unwrap();
        assert_eq!(latest.phase_reached, SwitchPhase::SourceDecommissioning);
        assert_eq!(latest.replacement_resource_id.as_deref(), Some("i-2"));
        assert!(latest.outcome.is_none());
    }
}
