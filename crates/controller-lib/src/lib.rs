//! Core library for the fleet switch controller
//!
//! Provides:
//! - Shared risk intelligence across tenants (poison map + event log)
//! - Model gate enforcing a single active production risk model
//! - Candidate selection weighing price against interruption risk
//! - The switch orchestrator state machine with drain and rollback
//! - Command channel with at-least-once delivery to polling agents
//! - Reconciliation sweeper for zombies, stale risk, and silent agents

pub mod channel;
pub mod error;
pub mod exec;
pub mod gate;
pub mod health;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod risk;
pub mod selector;
pub mod store;
pub mod sweeper;

pub use channel::{ChannelConfig, CommandChannel, LocalDispatcher};
pub use error::{CoreError, Result};
pub use exec::{Executor, MockExecutor, PoolSpec, ProviderStatus};
pub use gate::{MlModel, ModelGate, ModelStatus, Scorer};
pub use health::{ComponentStatus, HealthRegistry};
pub use models::{
    Candidate, Command, CommandKind, EnvironmentType, Heartbeat, InterruptionKind,
    InterruptionSignal, Lifecycle, ManagedResource, Pool, ResourceKind, ResourceStatus,
    SwitchOutcome, SwitchPhase, SwitchRecord,
};
pub use observability::{ControllerMetrics, StructuredLogger};
pub use orchestrator::{
    DrainConfig, OrchestratorConfig, SwitchOrchestrator, SwitchRequest, SwitchVariant,
};
pub use risk::RiskLedger;
pub use selector::{CandidateSelector, Constraints, PoolOffer, PriceBook, SelectorConfig};
pub use store::{Inventory, SwitchLog};
pub use sweeper::{ReconciliationSweeper, SweeperConfig};
