//! Observability infrastructure for the fleet controller
//!
//! Provides:
//! - Prometheus metrics (switch outcomes, drain timeouts, ledger and channel
//!   gauges, switch duration)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for switch duration (in seconds)
const SWITCH_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    switch_duration_seconds: Histogram,
    switches_started: IntCounter,
    switches_succeeded: IntCounter,
    switches_failed: IntCounter,
    switches_rolled_back: IntCounter,
    drain_timeouts: IntCounter,
    heartbeats: IntCounter,
    commands_dead_lettered: IntCounter,
    poisoned_pools: IntGauge,
    pending_commands: IntGauge,
    agents_online: IntGauge,
    active_switches: IntGauge,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            switch_duration_seconds: register_histogram!(
                "fleet_controller_switch_duration_seconds",
                "Wall-clock duration of switch attempts",
                SWITCH_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register switch_duration_seconds"),

            switches_started: register_int_counter!(
                "fleet_controller_switches_started_total",
                "Switch attempts initiated"
            )
            .expect("Failed to register switches_started_total"),

            switches_succeeded: register_int_counter!(
                "fleet_controller_switches_succeeded_total",
                "Switch attempts that reached a confirmed replacement"
            )
            .expect("Failed to register switches_succeeded_total"),

            switches_failed: register_int_counter!(
                "fleet_controller_switches_failed_total",
                "Switch attempts that ended in a failed terminal state"
            )
            .expect("Failed to register switches_failed_total"),

            switches_rolled_back: register_int_counter!(
                "fleet_controller_switches_rolled_back_total",
                "Switch attempts rolled back with the source untouched"
            )
            .expect("Failed to register switches_rolled_back_total"),

            drain_timeouts: register_int_counter!(
                "fleet_controller_drain_timeouts_total",
                "Node drains that hit their timeout and proceeded best-effort"
            )
            .expect("Failed to register drain_timeouts_total"),

            heartbeats: register_int_counter!(
                "fleet_controller_heartbeats_total",
                "Agent heartbeats ingested"
            )
            .expect("Failed to register heartbeats_total"),

            commands_dead_lettered: register_int_counter!(
                "fleet_controller_commands_dead_lettered_total",
                "Commands that exhausted their delivery budget"
            )
            .expect("Failed to register commands_dead_lettered_total"),

            poisoned_pools: register_int_gauge!(
                "fleet_controller_poisoned_pools",
                "Pools currently flagged unsafe by the risk ledger"
            )
            .expect("Failed to register poisoned_pools"),

            pending_commands: register_int_gauge!(
                "fleet_controller_pending_commands",
                "Commands queued and not yet acknowledged"
            )
            .expect("Failed to register pending_commands"),

            agents_online: register_int_gauge!(
                "fleet_controller_agents_online",
                "Agents heartbeating within the offline threshold"
            )
            .expect("Failed to register agents_online"),

            active_switches: register_int_gauge!(
                "fleet_controller_active_switches",
                "Switches currently in a non-terminal phase"
            )
            .expect("Failed to register active_switches"),
        }
    }
}

/// Controller metrics for Prometheus exposition.
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_switch_duration(&self, duration_secs: f64) {
        self.inner().switch_duration_seconds.observe(duration_secs);
    }

    pub fn inc_switches_started(&self) {
        self.inner().switches_started.inc();
    }

    pub fn inc_switches_succeeded(&self) {
        self.inner().switches_succeeded.inc();
    }

    pub fn inc_switches_failed(&self) {
        self.inner().switches_failed.inc();
    }

    pub fn inc_switches_rolled_back(&self) {
        self.inner().switches_rolled_back.inc();
    }

    pub fn inc_drain_timeouts(&self) {
        self.inner().drain_timeouts.inc();
    }

    pub fn inc_heartbeats(&self) {
        self.inner().heartbeats.inc();
    }

    pub fn inc_commands_dead_lettered(&self) {
        self.inner().commands_dead_lettered.inc();
    }

    pub fn set_poisoned_pools(&self, count: i64) {
        self.inner().poisoned_pools.set(count);
    }

    pub fn set_pending_commands(&self, count: i64) {
        self.inner().pending_commands.set(count);
    }

    pub fn set_agents_online(&self, count: i64) {
        self.inner().agents_online.set(count);
    }

    pub fn set_active_switches(&self, count: i64) {
        self.inner().active_switches.set(count);
    }
}

/// Structured lifecycle logger for operator-facing events
pub struct StructuredLogger {
    controller_id: String,
}

impl StructuredLogger {
    pub fn new(controller_id: &str) -> Self {
        Self {
            controller_id: controller_id.to_string(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            controller_id = %self.controller_id,
            version = %version,
            event = "startup",
            "Fleet controller starting"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            controller_id = %self.controller_id,
            reason = %reason,
            event = "shutdown",
            "Fleet controller shutting down"
        );
    }

    pub fn log_switch_started(&self, record_id: &str, source_resource_id: &str, reason: &str) {
        info!(
            controller_id = %self.controller_id,
            record_id = %record_id,
            source_resource_id = %source_resource_id,
            reason = %reason,
            event = "switch_started",
            "Switch initiated"
        );
    }

    pub fn log_switch_closed(&self, record_id: &str, outcome: &str, reason: &str) {
        info!(
            controller_id = %self.controller_id,
            record_id = %record_id,
            outcome = %outcome,
            reason = %reason,
            event = "switch_closed",
            "Switch reached terminal state"
        );
    }

    pub fn log_operator_attention(&self, resource_id: &str, detail: &str) {
        warn!(
            controller_id = %self.controller_id,
            resource_id = %resource_id,
            detail = %detail,
            event = "operator_attention",
            "Manual intervention required"
        );
    }
}
