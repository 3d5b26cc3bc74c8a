//! Switch orchestration state machine
//!
//! Drives one migration through its phases: choose a candidate, provision a
//! replacement through the command channel, verify it, drain the source,
//! decommission. The source is never decommissioned unless a verified,
//! drained replacement exists; any earlier failure tears the replacement
//! down and leaves the source untouched. At most one switch may be in
//! flight per source resource.

mod drain;

pub use drain::{drain_node, DrainConfig, DrainReport};

use crate::channel::CommandChannel;
use crate::error::{CoreError, Result};
use crate::exec::{with_backoff, Executor};
use crate::models::{
    Candidate, CommandKind, ManagedResource, ResourceKind, ResourceStatus, SwitchOutcome,
    SwitchPhase, SwitchRecord,
};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::selector::{CandidateSelector, Constraints, PriceBook};
use crate::store::{Inventory, SwitchLog};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on waiting for a provisioned replacement to become ready
    pub provision_timeout: Duration,
    pub verify_poll_interval: Duration,
    pub drain: DrainConfig,
    /// Hard-abort mode: a drain timeout rolls the switch back instead of
    /// proceeding best-effort
    pub drain_timeout_aborts: bool,
    /// Wait between marking the source a zombie and requesting termination,
    /// so traffic and DNS fully drain
    pub decommission_grace: Duration,
    /// Bound on waiting for a command acknowledgment
    pub command_timeout: Duration,
    /// Agent that executes provider-side commands for the controller
    pub executor_agent_id: String,
    pub provider_attempts: u32,
    pub provider_initial_backoff: Duration,
    pub provider_max_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(120),
            verify_poll_interval: Duration::from_secs(2),
            drain: DrainConfig::default(),
            drain_timeout_aborts: false,
            decommission_grace: Duration::from_secs(60),
            command_timeout: Duration::from_secs(120),
            executor_agent_id: "embedded-executor".to_string(),
            provider_attempts: 4,
            provider_initial_backoff: Duration::from_secs(1),
            provider_max_backoff: Duration::from_secs(30),
        }
    }
}

/// Drain semantics of the source resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum SwitchVariant {
    /// Bare instance: nothing to evict, the grace period covers traffic drain
    SingleInstance,
    /// Autoscaling-group member: switched in batches bounded by a capacity
    /// ceiling (see [`SwitchOrchestrator::run_batch`])
    AsgMember { capacity_ceiling: usize },
    /// Kubernetes node: cordon and evict pods before decommissioning
    KubernetesNode,
}

impl SwitchVariant {
    /// Drain variant matching a resource's provider-level shape; automatic
    /// switches (evaluation loop) derive the variant from the inventory
    pub fn for_kind(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Instance => SwitchVariant::SingleInstance,
            ResourceKind::AsgMember => SwitchVariant::AsgMember { capacity_ceiling: 1 },
            ResourceKind::KubernetesNode => SwitchVariant::KubernetesNode,
        }
    }
}

/// One requested migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub source_resource_id: String,
    #[serde(default)]
    pub constraints: Constraints,
    pub variant: SwitchVariant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// In-flight switch guard; one per source resource
struct ActiveSwitch {
    record_id: String,
    phase: Mutex<SwitchPhase>,
    cancel: AtomicBool,
}

/// A switch that passed validation and candidate selection and is ready to
/// be driven to a terminal state
pub struct StartedSwitch {
    record: SwitchRecord,
    source: ManagedResource,
    candidate: Candidate,
    variant: SwitchVariant,
    guard: Arc<ActiveSwitch>,
}

impl StartedSwitch {
    pub fn record_id(&self) -> &str {
        &self.record.record_id
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }
}

pub struct SwitchOrchestrator {
    selector: CandidateSelector,
    channel: Arc<CommandChannel>,
    executor: Arc<dyn Executor>,
    inventory: Arc<Inventory>,
    log: Arc<SwitchLog>,
    book: Arc<PriceBook>,
    config: OrchestratorConfig,
    active: DashMap<String, Arc<ActiveSwitch>>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl SwitchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        selector: CandidateSelector,
        channel: Arc<CommandChannel>,
        executor: Arc<dyn Executor>,
        inventory: Arc<Inventory>,
        log: Arc<SwitchLog>,
        book: Arc<PriceBook>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            selector,
            channel,
            executor,
            inventory,
            log,
            book,
            config,
            active: DashMap::new(),
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("orchestrator"),
        }
    }

    /// Validate, take the per-resource guard, and choose a candidate.
    ///
    /// Fails fast with `Conflict` when a switch is already in flight for the
    /// source, and with `NoCandidate` when even the stable fallback is
    /// unavailable (the opened record is closed `Failed` in that case).
    pub fn start(&self, request: &SwitchRequest) -> Result<StartedSwitch> {
        let source = self
            .inventory
            .get(&request.source_resource_id)
            .ok_or_else(|| {
                CoreError::NotFound(format!("resource {}", request.source_resource_id))
            })?;
        match source.status {
            ResourceStatus::Running => {}
            ResourceStatus::Switching | ResourceStatus::ZombieTerminating => {
                return Err(CoreError::Conflict(format!(
                    "resource {} is already mid-switch",
                    source.resource_id
                )))
            }
            ResourceStatus::Terminated => {
                return Err(CoreError::Validation(format!(
                    "resource {} is terminated",
                    source.resource_id
                )))
            }
        }

        let record = self.log.open(&source.resource_id, &source.tenant_id);
        let guard = Arc::new(ActiveSwitch {
            record_id: record.record_id.clone(),
            phase: Mutex::new(SwitchPhase::Initiated),
            cancel: AtomicBool::new(false),
        });
        match self.active.entry(source.resource_id.clone()) {
            Entry::Occupied(_) => {
                // Another request won the race; close our record and back off
                self.log.close(
                    &record,
                    SwitchPhase::Failed,
                    SwitchOutcome::Failed,
                    "concurrent switch already in progress",
                );
                return Err(CoreError::Conflict(format!(
                    "switch already in progress for {}",
                    source.resource_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(guard.clone());
            }
        }
        self.metrics.inc_switches_started();
        self.metrics.set_active_switches(self.active.len() as i64);
        self.logger.log_switch_started(
            &record.record_id,
            &source.resource_id,
            request.reason.as_deref().unwrap_or("scheduled evaluation"),
        );

        let candidates = match self
            .selector
            .select_candidates(&source.pool, &request.constraints)
        {
            Ok(candidates) => candidates,
            Err(err) => {
                let closed = self.log.close(
                    &record,
                    SwitchPhase::Failed,
                    SwitchOutcome::Failed,
                    format!("candidate selection failed: {err}"),
                );
                self.finish(&source.resource_id, &closed);
                return Err(err);
            }
        };
        // Selector guarantees non-empty on Ok
        let candidate = candidates[0].clone();

        let mut record = record;
        record.chosen_pool = Some(candidate.pool.clone());
        *guard.phase.lock().expect("switch guard poisoned") = SwitchPhase::CandidateChosen;

        Ok(StartedSwitch {
            record,
            source,
            candidate,
            variant: request.variant.clone(),
            guard,
        })
    }

    /// Drive a started switch to its last orchestrator-owned row.
    ///
    /// Phase errors never propagate: the returned record carries the outcome
    /// and a human-readable reason. A switch whose provider has not yet
    /// confirmed the source's deletion ends at a `SourceDecommissioning`
    /// progress row; the sweeper appends the `Confirmed` row later.
    pub async fn execute(&self, mut started: StartedSwitch) -> SwitchRecord {
        let begun = Instant::now();
        let source_id = started.source.resource_id.clone();
        let closed = self.drive(&mut started).await;
        self.metrics
            .observe_switch_duration(begun.elapsed().as_secs_f64());
        self.finish(&source_id, &closed);
        closed
    }

    /// Start and execute in one call
    pub async fn run_switch(&self, request: &SwitchRequest) -> Result<SwitchRecord> {
        let started = self.start(request)?;
        Ok(self.execute(started).await)
    }

    /// Switch a group of members in batches bounded by a capacity ceiling,
    /// so an autoscaling group never loses more than `capacity_ceiling`
    /// members of serving capacity at once.
    pub async fn run_batch(
        self: &Arc<Self>,
        requests: Vec<SwitchRequest>,
        capacity_ceiling: usize,
    ) -> Vec<Result<SwitchRecord>> {
        let ceiling = capacity_ceiling.max(1);
        let mut results = Vec::with_capacity(requests.len());
        for batch in requests.chunks(ceiling) {
            let mut handles = Vec::with_capacity(batch.len());
            for request in batch {
                let orchestrator = Arc::clone(self);
                let request = request.clone();
                handles.push(tokio::spawn(async move {
                    orchestrator.run_switch(&request).await
                }));
            }
            for handle in handles {
                results.push(handle.await.unwrap_or_else(|err| {
                    Err(CoreError::Provider(format!("switch task panicked: {err}")))
                }));
            }
        }
        results
    }

    /// Cancel an in-flight switch.
    ///
    /// Allowed only before the replacement is verified; once draining has
    /// begun the switch must run to a terminal state, otherwise the source
    /// would be left half-drained with no committed replacement.
    pub fn cancel(&self, source_resource_id: &str) -> Result<()> {
        let active = self.active.get(source_resource_id).ok_or_else(|| {
            CoreError::NotFound(format!("no active switch for {source_resource_id}"))
        })?;
        let phase = *active.phase.lock().expect("switch guard poisoned");
        match phase {
            SwitchPhase::Initiated
            | SwitchPhase::CandidateChosen
            | SwitchPhase::ReplacementProvisioning => {
                active.cancel.store(true, Ordering::SeqCst);
                info!(
                    record_id = %active.record_id,
                    source_resource_id = %source_resource_id,
                    phase = ?phase,
                    "Switch cancellation requested"
                );
                Ok(())
            }
            _ => Err(CoreError::Conflict(format!(
                "switch for {source_resource_id} is in {phase:?}; cancellation is refused once the replacement is verified"
            ))),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn drive(&self, s: &mut StartedSwitch) -> SwitchRecord {
        if s.guard.cancel.load(Ordering::SeqCst) {
            return self.log.close(
                &s.record,
                SwitchPhase::RolledBack,
                SwitchOutcome::RolledBack,
                "cancelled by operator before provisioning",
            );
        }

        // Provision the replacement through the command channel
        self.set_phase(s, SwitchPhase::ReplacementProvisioning);
        if let Err(err) = self
            .inventory
            .set_status(&s.source.resource_id, ResourceStatus::Switching)
        {
            return self.log.close(
                &s.record,
                SwitchPhase::Failed,
                SwitchOutcome::Failed,
                format!("source disappeared from inventory: {err}"),
            );
        }

        let provision = CommandKind::Provision {
            pool: s.candidate.pool.clone(),
            lifecycle: s.candidate.lifecycle,
            tenant_id: s.source.tenant_id.clone(),
        };
        let replacement_id = match self
            .channel
            .dispatch_and_wait(
                &self.config.executor_agent_id,
                provision,
                self.config.command_timeout,
            )
            .await
        {
            Ok(ack) if ack.success == Some(true) => ack.result_message.unwrap_or_default(),
            Ok(ack) => {
                return self.fail_before_commit(
                    s,
                    format!(
                        "provisioning refused: {}",
                        ack.result_message.unwrap_or_else(|| "no detail".into())
                    ),
                );
            }
            Err(err) => {
                return self
                    .fail_before_commit(s, format!("provisioning not acknowledged: {err}"));
            }
        };
        if replacement_id.is_empty() {
            return self.fail_before_commit(s, "provisioning ack carried no resource id");
        }
        s.record.replacement_resource_id = Some(replacement_id.clone());

        if s.guard.cancel.load(Ordering::SeqCst) {
            self.teardown_replacement(&replacement_id).await;
            if let Err(err) = self
                .inventory
                .set_status(&s.source.resource_id, ResourceStatus::Running)
            {
                warn!(error = %err, "Failed to restore source status after cancel");
            }
            return self.log.close(
                &s.record,
                SwitchPhase::RolledBack,
                SwitchOutcome::RolledBack,
                "cancelled by operator; replacement torn down",
            );
        }

        // Verify readiness within a bounded wait
        if let Err(err) = self.verify_replacement(&replacement_id).await {
            self.teardown_replacement(&replacement_id).await;
            return self.fail_before_commit(
                s,
                format!("replacement {replacement_id} never became ready: {err}"),
            );
        }
        self.set_phase(s, SwitchPhase::ReplacementVerified);
        self.inventory.register(ManagedResource::new(
            replacement_id.clone(),
            s.candidate.pool.clone(),
            s.candidate.lifecycle,
            &s.source.tenant_id,
            s.source.environment,
        ));

        // Drain the source per variant
        self.set_phase(s, SwitchPhase::Draining);
        if s.variant == SwitchVariant::KubernetesNode {
            match drain_node(
                self.executor.as_ref(),
                &s.source.resource_id,
                &self.config.drain,
            )
            .await
            {
                Ok(report) if report.timed_out => {
                    if self.config.drain_timeout_aborts {
                        self.teardown_replacement(&replacement_id).await;
                        if let Err(err) = self
                            .inventory
                            .set_status(&s.source.resource_id, ResourceStatus::Running)
                        {
                            warn!(error = %err, "Failed to restore source status after drain abort");
                        }
                        return self.log.close(
                            &s.record,
                            SwitchPhase::RolledBack,
                            SwitchOutcome::RolledBack,
                            format!(
                                "drain timed out with {} pods blocked (hard-abort mode)",
                                report.blocked
                            ),
                        );
                    }
                    // Best-effort boundary: proceeding after a drain timeout
                    // is deliberate and flagged, not silent data loss
                    self.metrics.inc_drain_timeouts();
                    s.record.drain_timed_out = true;
                    warn!(
                        record_id = %s.record.record_id,
                        node_id = %s.source.resource_id,
                        blocked = report.blocked,
                        "Drain timed out, proceeding to decommission with downgraded safety"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    // Drain never completed; the source keeps its workload
                    self.teardown_replacement(&replacement_id).await;
                    if let Err(restore) = self
                        .inventory
                        .set_status(&s.source.resource_id, ResourceStatus::Running)
                    {
                        warn!(error = %restore, "Failed to restore source status after drain failure");
                    }
                    return self.log.close(
                        &s.record,
                        SwitchPhase::RolledBack,
                        SwitchOutcome::RolledBack,
                        format!("drain failed: {err}"),
                    );
                }
            }
        }

        // Decommission: zombie, grace, terminate, provider-confirmed close
        self.set_phase(s, SwitchPhase::SourceDecommissioning);
        if let Err(err) = self.inventory.mark_zombie(&s.source.resource_id) {
            return self.log.close(
                &s.record,
                SwitchPhase::Failed,
                SwitchOutcome::Failed,
                format!("failed to mark source for termination: {err}"),
            );
        }
        s.record.cost_delta = self
            .book
            .current_price(&s.source.pool)
            .map(|source_price| s.candidate.price - source_price);

        if let Some(agent) = self
            .channel
            .registry()
            .agent_for_resource(&s.source.resource_id)
        {
            // Best-effort: the source's own agent stops accepting work
            self.channel.enqueue(
                &agent,
                CommandKind::PrepareShutdown {
                    resource_id: s.source.resource_id.clone(),
                    grace_secs: self.config.decommission_grace.as_secs(),
                },
            );
        }
        tokio::time::sleep(self.config.decommission_grace).await;

        let config = &self.config;
        if let Err(err) = with_backoff(
            "terminate source",
            config.provider_attempts,
            config.provider_initial_backoff,
            config.provider_max_backoff,
            || self.executor.terminate(&s.source.resource_id),
        )
        .await
        {
            // The zombie stays; the sweeper re-issues termination
            return self.log.close(
                &s.record,
                SwitchPhase::Failed,
                SwitchOutcome::Failed,
                format!("termination request failed, sweeper will retry: {err}"),
            );
        }

        match self.executor.describe(&s.source.resource_id).await {
            Ok(status) if status.is_gone() => {
                if let Err(err) = self.inventory.confirm_terminated(&s.source.resource_id) {
                    warn!(error = %err, "Failed to record confirmed termination");
                }
                let reason = if s.record.drain_timed_out {
                    format!("replacement {replacement_id} live; drain timed out, proceeded best-effort")
                } else {
                    format!("replacement {replacement_id} live in {}", s.candidate.pool)
                };
                self.log.close(
                    &s.record,
                    SwitchPhase::Confirmed,
                    SwitchOutcome::Success,
                    reason,
                )
            }
            _ => {
                // Confirmation comes from the provider, via the sweeper,
                // never from the request's success
                self.log
                    .append_progress(&s.record, SwitchPhase::SourceDecommissioning)
            }
        }
    }

    /// Poll until the replacement is ready: provider reports `Running`, or
    /// an agent is already heartbeating for it.
    async fn verify_replacement(&self, resource_id: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.provision_timeout;
        loop {
            match self.executor.describe(resource_id).await {
                Ok(status) if status == crate::exec::ProviderStatus::Running => return Ok(()),
                Ok(status) if status.is_gone() => {
                    return Err(CoreError::Provider(format!(
                        "replacement {resource_id} disappeared during verification"
                    )))
                }
                Ok(_) | Err(_) => {}
            }
            if self
                .channel
                .registry()
                .agent_for_resource(resource_id)
                .is_some()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::Timeout {
                    operation: format!("readiness of replacement {resource_id}"),
                    waited_secs: self.config.provision_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.verify_poll_interval).await;
        }
    }

    /// Failure before anything was committed: restore the source and close
    /// `Failed`. Any provisioned replacement has already been torn down.
    fn fail_before_commit(&self, s: &StartedSwitch, reason: impl Into<String>) -> SwitchRecord {
        if let Err(err) = self
            .inventory
            .set_status(&s.source.resource_id, ResourceStatus::Running)
        {
            warn!(error = %err, "Failed to restore source status");
        }
        self.log.close(
            &s.record,
            SwitchPhase::Failed,
            SwitchOutcome::Failed,
            reason,
        )
    }

    async fn teardown_replacement(&self, resource_id: &str) {
        let config = &self.config;
        let result = with_backoff(
            "teardown replacement",
            config.provider_attempts,
            config.provider_initial_backoff,
            config.provider_max_backoff,
            || self.executor.terminate(resource_id),
        )
        .await;
        match result {
            // NotFound means the provider already considers the resource gone
            Ok(()) | Err(CoreError::NotFound(_)) => {
                if self.inventory.get(resource_id).is_some() {
                    if let Err(err) = self.inventory.confirm_terminated(resource_id) {
                        warn!(resource_id = %resource_id, error = %err, "Teardown bookkeeping failed");
                    }
                }
            }
            Err(err) => {
                // Leak surfaced for the sweeper / operator rather than hidden
                warn!(
                    resource_id = %resource_id,
                    error = %err,
                    "Failed to tear down replacement; resource may be leaked"
                );
            }
        }
    }

    fn set_phase(&self, s: &mut StartedSwitch, phase: SwitchPhase) {
        *s.guard.phase.lock().expect("switch guard poisoned") = phase;
        s.record.phase_reached = phase;
    }

    fn finish(&self, source_resource_id: &str, closed: &SwitchRecord) {
        self.active.remove(source_resource_id);
        self.metrics.set_active_switches(self.active.len() as i64);
        let outcome = match closed.outcome {
            Some(SwitchOutcome::Success) => {
                self.metrics.inc_switches_succeeded();
                "success"
            }
            Some(SwitchOutcome::Failed) => {
                self.metrics.inc_switches_failed();
                "failed"
            }
            Some(SwitchOutcome::RolledBack) => {
                self.metrics.inc_switches_rolled_back();
                "rolled_back"
            }
            // Left at a progress row; the sweeper appends the terminal one
            None => "pending_confirmation",
        };
        self.logger.log_switch_closed(
            &closed.record_id,
            outcome,
            closed.reason.as_deref().unwrap_or(""),
        );
    }
}
