//! Node drain: best-effort pod eviction with a bounded wait
//!
//! DaemonSet-owned pods are skipped (the kubelet recreates them anyway) and
//! pods blocked by a disruption budget are retried each pass. The wait is
//! bounded: a drain that never reaches zero evictable pods hands back a
//! timed-out report rather than blocking the fleet on a stuck budget.

use crate::error::Result;
use crate::exec::Executor;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drain tuning
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Bound on the whole drain (default 5 minutes)
    pub timeout: Duration,
    /// Delay between eviction passes
    pub poll_interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// What a drain accomplished
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub evicted: usize,
    pub skipped_daemonset: usize,
    /// Pods a disruption budget was still blocking when the drain ended
    pub blocked: usize,
    pub timed_out: bool,
}

/// Cordon a node and evict its workload pods until none remain or the
/// timeout elapses. Eviction refusals (disruption budgets) are retried each
/// pass, never treated as hard failures.
pub async fn drain_node(
    executor: &dyn Executor,
    node_id: &str,
    config: &DrainConfig,
) -> Result<DrainReport> {
    executor.cordon(node_id).await?;
    info!(node_id = %node_id, timeout_secs = config.timeout.as_secs(), "Draining node");

    let deadline = tokio::time::Instant::now() + config.timeout;
    let mut report = DrainReport::default();

    loop {
        let pods = executor.list_pods(node_id).await?;
        report.skipped_daemonset = pods.iter().filter(|p| p.daemonset_owned).count();
        let evictable: Vec<_> = pods.iter().filter(|p| !p.daemonset_owned).collect();

        if evictable.is_empty() {
            info!(
                node_id = %node_id,
                evicted = report.evicted,
                skipped_daemonset = report.skipped_daemonset,
                "Drain complete"
            );
            report.blocked = 0;
            return Ok(report);
        }

        let mut blocked = 0;
        for pod in &evictable {
            match executor.evict(pod).await {
                Ok(()) => {
                    debug!(namespace = %pod.namespace, pod = %pod.name, "Pod evicted");
                    report.evicted += 1;
                }
                Err(err) => {
                    debug!(
                        namespace = %pod.namespace,
                        pod = %pod.name,
                        error = %err,
                        "Eviction refused, will retry"
                    );
                    blocked += 1;
                }
            }
        }
        report.blocked = blocked;

        if tokio::time::Instant::now() >= deadline {
            warn!(
                node_id = %node_id,
                remaining = evictable.len(),
                blocked,
                "Drain timed out with pods remaining, proceeding best-effort"
            );
            report.timed_out = true;
            return Ok(report);
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}
