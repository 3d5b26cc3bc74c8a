//! Core data models for the fleet controller

use serde::{Deserialize, Serialize};
use std::fmt;

/// A class of interchangeable cloud capacity: region + zone + resource type.
///
/// Pools are not persisted as their own rows; they are the composite key
/// used by the risk ledger and pricing lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pool {
    pub region: String,
    pub zone: String,
    pub resource_type: String,
}

impl Pool {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.resource_type)
    }
}

/// Pricing lifecycle of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Cheap capacity that the provider may reclaim at any time
    Interruptible,
    /// On-demand capacity that is never reclaimed
    Stable,
}

/// Whether a resource belongs to a production workload or a lab/experimental one.
///
/// Only production interruptions are allowed to poison the shared risk ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Production,
    Lab,
}

/// Provider-level shape of a managed resource; decides how the source is
/// drained when the resource is switched away from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Bare instance, nothing to evict
    #[default]
    Instance,
    /// Member of an autoscaling group
    AsgMember,
    /// Kubernetes node; must be cordoned and drained before decommission
    KubernetesNode,
}

/// Lifecycle status of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Running,
    Switching,
    /// Replacement is live; the source is awaiting provider-confirmed deletion
    ZombieTerminating,
    Terminated,
}

/// An instance or node under fleet management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedResource {
    /// Provider resource id (instance id, node provider id)
    pub resource_id: String,
    pub pool: Pool,
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub kind: ResourceKind,
    pub tenant_id: String,
    pub environment: EnvironmentType,
    pub status: ResourceStatus,
    pub termination_attempted_at: Option<i64>,
    /// Set only once the provider confirms deletion; the request alone is
    /// never authoritative
    pub termination_confirmed: bool,
}

impl ManagedResource {
    pub fn new(
        resource_id: impl Into<String>,
        pool: Pool,
        lifecycle: Lifecycle,
        tenant_id: impl Into<String>,
        environment: EnvironmentType,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            pool,
            lifecycle,
            kind: ResourceKind::Instance,
            tenant_id: tenant_id.into(),
            environment,
            status: ResourceStatus::Running,
            termination_attempted_at: None,
            termination_confirmed: false,
        }
    }

    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Kind of interruption notice observed on an interruptible resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionKind {
    RebalanceNotice,
    TerminationNotice,
}

/// A single observed price for a pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: i64,
    pub price: f64,
}

/// A ranked replacement option produced by the candidate selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub pool: Pool,
    pub lifecycle: Lifecycle,
    pub price: f64,
    pub risk_score: f32,
    /// Weighted combination of normalized price and risk; lower is better
    pub combined_score: f64,
}

/// Phase of a switch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPhase {
    Initiated,
    CandidateChosen,
    ReplacementProvisioning,
    ReplacementVerified,
    Draining,
    SourceDecommissioning,
    Confirmed,
    Failed,
    RolledBack,
}

impl SwitchPhase {
    /// Terminal phases close a switch record
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwitchPhase::Confirmed | SwitchPhase::Failed | SwitchPhase::RolledBack
        )
    }
}

/// Outcome of one migration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchOutcome {
    Success,
    Failed,
    RolledBack,
}

/// Append-only audit row for one migration attempt.
///
/// A row is appended when the switch is initiated and again at every terminal
/// transition; rows are never mutated in place. A retried switch gets a fresh
/// record id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub record_id: String,
    pub source_resource_id: String,
    pub tenant_id: String,
    pub chosen_pool: Option<Pool>,
    pub replacement_resource_id: Option<String>,
    pub phase_reached: SwitchPhase,
    pub outcome: Option<SwitchOutcome>,
    /// Human-readable reason carried on every terminal row
    pub reason: Option<String>,
    /// Hourly price difference (replacement minus source); negative saves money
    pub cost_delta: Option<f64>,
    /// Set when a node drain hit its timeout and the switch proceeded anyway
    pub drain_timed_out: bool,
    pub created_at: i64,
    pub closed_at: Option<i64>,
}

/// A unit of work queued for a specific agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub target_agent_id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub created_at: i64,
    pub executed_at: Option<i64>,
    pub success: Option<bool>,
    pub result_message: Option<String>,
}

/// Payload of a queued command.
///
/// Commands are idempotent by id: an agent that already applied a command
/// re-acks the recorded result instead of re-applying the effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandKind {
    /// Launch a replacement resource into the given pool
    Provision {
        pool: Pool,
        lifecycle: Lifecycle,
        tenant_id: String,
    },
    /// Terminate a provider resource
    Terminate { resource_id: String },
    /// Stop accepting new work ahead of decommission
    PrepareShutdown {
        resource_id: String,
        grace_secs: u64,
    },
    /// Cordon a Kubernetes node before draining it
    CordonNode { node_id: String },
}

/// Interruption signal carried on an agent heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionSignal {
    pub kind: InterruptionKind,
    pub pool: Pool,
    pub resource_id: String,
}

/// Agent heartbeat payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub resource_id: String,
    pub lifecycle: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interruption: Option<InterruptionSignal>,
}
