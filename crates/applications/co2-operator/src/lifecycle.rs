//! Node lifecycle: allow, drain and power bookkeeping
//!
//! Converges the cluster and the power log with the selector's decision:
//!
//! ```text
//! allow(node)                      disallow(node)
//!     │                                │
//!     ├── start if believed stopped    ├── 1. Cordon (unschedulable)
//!     │   (POWER=1)                    ├── 2. Evict every workload (best effort)
//!     └── uncordon                     ├── 3. Poll until empty (5s, max 300s)
//!                                      └── 4. Drained → stop (POWER=0, once)
//! ```
//!
//! ## Key Design Decisions
//!
//! - **Bookkeeping before uncordon**: if the uncordon fails, the next cycle
//!   repeats it; allowing an allowed node is a no-op
//! - **Never stop a busy node**: POWER=0 is only recorded after the node is
//!   observed empty; a timeout leaves it cordoned and retried next cycle
//! - **Best-effort eviction**: one failed eviction never blocks the rest
//! - **Dry run**: mutations are server-side validated only and the drain
//!   wait is skipped

use crate::cluster::{ClusterApi, Workload};
use crate::error::Result;
use crate::store::{MetricKind, MetricsStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default bound on the drain wait
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 300;

/// Default interval between drain polls
pub const DEFAULT_DRAIN_POLL_SECS: u64 = 5;

/// Outcome of draining a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainStatus {
    /// No workloads left on the node
    Drained,
    /// Workloads still present when the timeout expired
    TimedOut,
    /// Shutdown requested while waiting
    Cancelled,
    /// Cordon or workload listing failed
    Failed,
}

/// Result of [`NodeLifecycleManager::disallow`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainResult {
    /// Node that was disallowed
    pub node_name: String,
    /// Final status
    pub status: DrainStatus,
    /// Eviction requests issued
    pub evictions_requested: usize,
    /// Eviction requests that failed
    pub evictions_failed: usize,
    /// Whether this call recorded the node as stopped
    pub marked_stopped: bool,
    /// Time spent in `disallow` (seconds)
    pub drain_time_secs: f64,
}

/// Result of [`NodeLifecycleManager::allow`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowResult {
    /// Node that was allowed
    pub node_name: String,
    /// Whether this call recorded the node as started
    pub started: bool,
    /// Whether the uncordon request succeeded
    pub schedulable: bool,
}

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Validate cluster mutations without committing them
    pub dry_run: bool,

    /// Bound on the drain wait
    pub drain_timeout: Duration,

    /// Interval between drain polls
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_DRAIN_POLL_SECS),
        }
    }
}

impl LifecycleConfig {
    /// Set dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set drain poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Applies allow/disallow decisions to the cluster and the power log
pub struct NodeLifecycleManager {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<MetricsStore>,
    config: LifecycleConfig,
}

impl NodeLifecycleManager {
    /// Create a lifecycle manager
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<MetricsStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            config,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Keep `node` schedulable, starting it first if it is believed stopped.
    ///
    /// Cluster errors are logged and reported in the result; store errors
    /// are returned.
    pub async fn allow(&self, node: &str) -> Result<AllowResult> {
        info!(node = %node, "Allowing node for pod scheduling");

        let started = if self.store.is_running(node).await?.value {
            false
        } else {
            info!(node = %node, "Starting node");
            self.store.record(node, MetricKind::Power, 1.0).await?;
            true
        };

        let schedulable = match self
            .cluster
            .set_schedulable(node, true, self.config.dry_run)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    node = %node,
                    error = %e,
                    "Failed to mark node schedulable, retrying next cycle"
                );
                false
            }
        };

        Ok(AllowResult {
            node_name: node.to_string(),
            started,
            schedulable,
        })
    }

    /// Cordon `node`, evict its workloads and record it as stopped once empty.
    ///
    /// Cluster errors are isolated to this node and reported in the result;
    /// store errors are returned.
    pub async fn disallow(&self, node: &str, shutdown: &CancellationToken) -> Result<DrainResult> {
        let start = Instant::now();
        let mut result = DrainResult {
            node_name: node.to_string(),
            status: DrainStatus::Failed,
            evictions_requested: 0,
            evictions_failed: 0,
            marked_stopped: false,
            drain_time_secs: 0.0,
        };

        info!(node = %node, "Disallowing node");

        if let Err(e) = self
            .cluster
            .set_schedulable(node, false, self.config.dry_run)
            .await
        {
            error!(node = %node, error = %e, "Failed to cordon node");
            result.drain_time_secs = start.elapsed().as_secs_f64();
            return Ok(result);
        }

        let workloads = match self.cluster.list_workloads(node).await {
            Ok(workloads) => workloads,
            Err(e) => {
                error!(node = %node, error = %e, "Failed to list workloads on node");
                result.drain_time_secs = start.elapsed().as_secs_f64();
                return Ok(result);
            }
        };

        result.evictions_requested = workloads.len();
        result.evictions_failed = self.evict_all(&workloads).await;

        info!(node = %node, "Waiting for node to be drained...");

        result.status = if self.config.dry_run {
            DrainStatus::Drained
        } else {
            self.wait_for_drain(node, shutdown).await
        };

        match result.status {
            DrainStatus::Drained => {
                info!(node = %node, "Node has been drained");
                if self.store.is_running(node).await?.value {
                    self.store.record(node, MetricKind::Power, 0.0).await?;
                    result.marked_stopped = true;
                }
                info!(node = %node, "Node has been shut down");
            }
            DrainStatus::TimedOut => {
                error!(
                    node = %node,
                    timeout_secs = self.config.drain_timeout.as_secs(),
                    "Timeout while waiting for node to be drained"
                );
            }
            DrainStatus::Cancelled => {
                warn!(node = %node, "Drain interrupted by shutdown");
            }
            DrainStatus::Failed => {}
        }

        result.drain_time_secs = start.elapsed().as_secs_f64();
        Ok(result)
    }

    /// Request eviction of every workload. Returns the number of failures.
    async fn evict_all(&self, workloads: &[Workload]) -> usize {
        let mut failed = 0;

        for workload in workloads {
            info!(workload = %workload, "Evicting pod");
            if let Err(e) = self.cluster.evict(workload, self.config.dry_run).await {
                error!(workload = %workload, error = %e, "Failed to evict pod");
                failed += 1;
            }
        }

        failed
    }

    /// Poll until `node` has no workloads, the timeout expires, or shutdown is requested.
    ///
    /// The last poll sleep is shortened so the wait never outlasts the timeout.
    pub async fn wait_for_drain(&self, node: &str, shutdown: &CancellationToken) -> DrainStatus {
        let deadline = Instant::now() + self.config.drain_timeout;

        while Instant::now() < deadline {
            match self.cluster.list_workloads(node).await {
                Ok(workloads) if workloads.is_empty() => return DrainStatus::Drained,
                Ok(workloads) => {
                    debug!(node = %node, remaining = workloads.len(), "Still draining");
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to check drain progress");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval.min(remaining)) => {}
                _ = shutdown.cancelled() => return DrainStatus::Cancelled,
            }
        }

        DrainStatus::TimedOut
    }
}
