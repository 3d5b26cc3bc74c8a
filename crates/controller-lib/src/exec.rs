//! Executor capability: the seam to cloud and cluster providers
//!
//! The core never binds provider APIs directly; it consumes this trait and
//! treats failures as typed, retryable errors. `MockExecutor` is the
//! in-process implementation used by tests and the embedded dispatcher in
//! development.

use crate::error::{CoreError, Result};
use crate::models::{Lifecycle, Pool};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Provider-side view of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Running,
    Terminated,
    NotFound,
}

impl ProviderStatus {
    /// Whether the provider considers the resource gone
    pub fn is_gone(&self) -> bool {
        matches!(self, ProviderStatus::Terminated | ProviderStatus::NotFound)
    }
}

/// Reference to a pod scheduled on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    /// DaemonSet pods are recreated by the kubelet and are skipped by drains
    pub daemonset_owned: bool,
    /// False while a disruption budget blocks eviction
    pub eviction_allowed: bool,
}

/// Specification for launching a replacement resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub pool: Pool,
    pub lifecycle: Lifecycle,
    pub tenant_id: String,
}

/// Provider operations consumed by the orchestrator and sweeper
#[async_trait]
pub trait Executor: Send + Sync {
    async fn launch(&self, spec: &PoolSpec) -> Result<String>;
    async fn terminate(&self, resource_id: &str) -> Result<()>;
    async fn describe(&self, resource_id: &str) -> Result<ProviderStatus>;
    async fn cordon(&self, node_id: &str) -> Result<()>;
    async fn list_pods(&self, node_id: &str) -> Result<Vec<PodRef>>;
    async fn evict(&self, pod: &PodRef) -> Result<()>;
}

/// Retry a provider call with exponential backoff up to a bounded attempt
/// count. Non-retryable errors surface immediately.
pub async fn with_backoff<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    operation = %operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Provider call failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, max_backoff);
            }
            Err(err) => {
                warn!(operation = %operation, attempt, error = %err, "Provider call failed");
                return Err(err);
            }
        }
    }
}

/// In-process provider for tests and the embedded dispatcher.
///
/// Behavior is scripted through flags: held terminations keep a resource
/// `Running` after a terminate call (zombie scenario), launch failures make
/// the next launches fail, and pods with `eviction_allowed = false` model a
/// blocking disruption budget.
pub struct MockExecutor {
    resources: DashMap<String, ProviderStatus>,
    pods: DashMap<String, Vec<PodRef>>,
    launch_counter: AtomicU64,
    fail_launches: AtomicU64,
    hold_terminations: AtomicBool,
    launch_as_pending: AtomicBool,
    launches: DashMap<String, PoolSpec>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            pods: DashMap::new(),
            launch_counter: AtomicU64::new(0),
            fail_launches: AtomicU64::new(0),
            hold_terminations: AtomicBool::new(false),
            launch_as_pending: AtomicBool::new(false),
            launches: DashMap::new(),
        }
    }

    /// Pre-register an existing resource
    pub fn seed_resource(&self, resource_id: &str, status: ProviderStatus) {
        self.resources.insert(resource_id.to_string(), status);
    }

    pub fn seed_pods(&self, node_id: &str, pods: Vec<PodRef>) {
        self.pods.insert(node_id.to_string(), pods);
    }

    /// Make the next `count` launches fail with a provider error
    pub fn fail_next_launches(&self, count: u64) {
        self.fail_launches.store(count, Ordering::SeqCst);
    }

    /// Keep resources `Running` after terminate calls until released
    pub fn hold_terminations(&self, hold: bool) {
        self.hold_terminations.store(hold, Ordering::SeqCst);
    }

    /// Make launched resources start `Pending` instead of `Running`
    pub fn launch_as_pending(&self, pending: bool) {
        self.launch_as_pending.store(pending, Ordering::SeqCst);
    }

    /// Flip a pending resource to running, as if it became ready
    pub fn make_running(&self, resource_id: &str) {
        self.resources
            .insert(resource_id.to_string(), ProviderStatus::Running);
    }

    /// Flip a held resource to terminated, as if the provider caught up
    pub fn release_termination(&self, resource_id: &str) {
        self.resources
            .insert(resource_id.to_string(), ProviderStatus::Terminated);
    }

    /// Pool specs of every launch that succeeded
    pub fn launched(&self) -> Vec<(String, PoolSpec)> {
        self.launches
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn launch(&self, spec: &PoolSpec) -> Result<String> {
        let remaining = self.fail_launches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_launches.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::Provider("insufficient capacity".into()));
        }
        let n = self.launch_counter.fetch_add(1, Ordering::SeqCst);
        let resource_id = format!("i-mock{n:04}");
        let status = if self.launch_as_pending.load(Ordering::SeqCst) {
            ProviderStatus::Pending
        } else {
            ProviderStatus::Running
        };
        self.resources.insert(resource_id.clone(), status);
        self.launches.insert(resource_id.clone(), spec.clone());
        debug!(resource_id = %resource_id, pool = %spec.pool, "Mock launch");
        Ok(resource_id)
    }

    async fn terminate(&self, resource_id: &str) -> Result<()> {
        if !self.resources.contains_key(resource_id) {
            return Err(CoreError::NotFound(format!("resource {resource_id}")));
        }
        if !self.hold_terminations.load(Ordering::SeqCst) {
            self.resources
                .insert(resource_id.to_string(), ProviderStatus::Terminated);
        }
        Ok(())
    }

    async fn describe(&self, resource_id: &str) -> Result<ProviderStatus> {
        Ok(self
            .resources
            .get(resource_id)
            .map(|s| *s)
            .unwrap_or(ProviderStatus::NotFound))
    }

    async fn cordon(&self, _node_id: &str) -> Result<()> {
        Ok(())
    }

    async fn list_pods(&self, node_id: &str) -> Result<Vec<PodRef>> {
        Ok(self
            .pods
            .get(node_id)
            .map(|p| p.clone())
            .unwrap_or_default())
    }

    async fn evict(&self, pod: &PodRef) -> Result<()> {
        if !pod.eviction_allowed {
            return Err(CoreError::Provider(format!(
                "disruption budget blocks eviction of {}/{}",
                pod.namespace, pod.name
            )));
        }
        // Pods are keyed by node here; real providers address evictions by pod
        for mut entry in self.pods.iter_mut() {
            entry.retain(|p| !(p.namespace == pod.namespace && p.name == pod.name));
        }
        Ok(())
    }
}
