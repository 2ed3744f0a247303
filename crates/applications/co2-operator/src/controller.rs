//! Control loop
//!
//! One cycle scores every node, splits them with [`select_nodes`] and applies
//! the decision through the [`NodeLifecycleManager`]:
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌────────┐   ┌────────────────────┐
//! │ list nodes   │──▶│ estimate  │──▶│ select │──▶│ allow*, disallow*  │
//! │ − ignored    │   │ (MOER)    │   │ 50/50  │   │ (serial)           │
//! └──────────────┘   └───────────┘   └────────┘   └─────────┬──────────┘
//!        ▲                                                  │
//!        └──────────── sleep(cycle_interval) / cancel ◀─────┘
//! ```
//!
//! ## Key Design Decisions
//!
//! - **No overlap**: the interval starts after a cycle completes
//! - **Allow before disallow**: capacity is added before it is removed
//! - **Cancellation**: the token cuts short both the inter-cycle wait and an
//!   in-flight drain wait; committed mutations are not rolled back
//! - **Fatal errors**: store and configuration failures end [`Controller::run`]
//!   with an error; any other failed cycle is logged and retried after the
//!   interval

use crate::cluster::ClusterApi;
use crate::config::DEFAULT_CYCLE_INTERVAL_SECS;
use crate::emission::EmissionEstimator;
use crate::error::Result;
use crate::lifecycle::{AllowResult, DrainResult, DrainStatus, NodeLifecycleManager};
use crate::select::{NodeScore, select_nodes};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the control loop
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay between the end of one cycle and the start of the next
    pub cycle_interval: Duration,

    /// Nodes excluded from every decision
    pub ignored_nodes: Vec<String>,

    /// Score and record only, never actuate
    pub observe_only: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS),
            ignored_nodes: Vec::new(),
            observe_only: false,
        }
    }
}

impl ControllerConfig {
    /// Set cycle interval
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    /// Set ignored nodes
    pub fn with_ignored_nodes(mut self, nodes: Vec<String>) -> Self {
        self.ignored_nodes = nodes;
        self
    }

    /// Set observe-only mode
    pub fn with_observe_only(mut self, observe_only: bool) -> Self {
        self.observe_only = observe_only;
        self
    }

    fn is_ignored(&self, node: &str) -> bool {
        self.ignored_nodes.iter().any(|ignored| ignored == node)
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    /// Emission values, in node-list order
    pub scores: Vec<NodeScore>,
    /// Outcomes for the allowed nodes
    pub allowed: Vec<AllowResult>,
    /// Outcomes for the disallowed nodes, in drain order
    pub disallowed: Vec<DrainResult>,
    /// Whether the cycle ran in observe-only mode
    pub observe_only: bool,
    /// Whether shutdown cut the cycle short
    pub interrupted: bool,
    /// Cycle duration (seconds)
    pub cycle_time_secs: f64,
}

impl CycleReport {
    /// Number of nodes recorded as stopped in this cycle
    pub fn stopped_count(&self) -> usize {
        self.disallowed.iter().filter(|r| r.marked_stopped).count()
    }
}

/// Periodic carbon-aware node controller
pub struct Controller {
    cluster: Arc<dyn ClusterApi>,
    estimator: EmissionEstimator,
    lifecycle: NodeLifecycleManager,
    config: ControllerConfig,
}

impl Controller {
    /// Create a controller
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        estimator: EmissionEstimator,
        lifecycle: NodeLifecycleManager,
        config: ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            estimator,
            lifecycle,
            config,
        }
    }

    /// Run one scoring and actuation cycle
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> Result<CycleReport> {
        let start = Instant::now();
        let mut report = CycleReport {
            observe_only: self.config.observe_only,
            ..CycleReport::default()
        };

        let nodes: Vec<String> = self
            .cluster
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| {
                let ignored = self.config.is_ignored(node);
                if ignored {
                    debug!(node = %node, "Skipping ignored node");
                }
                !ignored
            })
            .collect();

        for node in &nodes {
            let moer = self.estimator.estimate(node).await?;
            report.scores.push(NodeScore::new(node.clone(), moer));
        }

        let rates: Vec<String> = report
            .scores
            .iter()
            .map(|s| format!("{}={:.1}", s.node_name, s.moer))
            .collect();
        info!(
            nodes = report.scores.len(),
            strategy = self.estimator.strategy_name(),
            rates = %rates.join(", "),
            "Node emission rates"
        );

        if self.config.observe_only {
            report.cycle_time_secs = start.elapsed().as_secs_f64();
            return Ok(report);
        }

        let selection = select_nodes(report.scores.clone());
        info!(
            allow = ?selection.allowed_names(),
            disallow = ?selection.disallowed_names(),
            "Selected nodes"
        );

        for score in &selection.allow {
            report.allowed.push(self.lifecycle.allow(&score.node_name).await?);
        }

        for score in &selection.disallow {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let result = self.lifecycle.disallow(&score.node_name, shutdown).await?;
            let cancelled = result.status == DrainStatus::Cancelled;
            report.disallowed.push(result);
            if cancelled {
                report.interrupted = true;
                break;
            }
        }

        report.cycle_time_secs = start.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Run cycles until `shutdown` is cancelled or a fatal error occurs
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            cycle_interval_secs = self.config.cycle_interval.as_secs(),
            dry_run = self.lifecycle.config().dry_run,
            observe_only = self.config.observe_only,
            ignored = ?self.config.ignored_nodes,
            "Starting control loop"
        );

        while !shutdown.is_cancelled() {
            match self.run_cycle(&shutdown).await {
                Ok(report) if report.interrupted => {
                    warn!("Cycle interrupted by shutdown");
                    break;
                }
                Ok(report) => {
                    info!(
                        nodes = report.scores.len(),
                        allowed = report.allowed.len(),
                        disallowed = report.disallowed.len(),
                        stopped = report.stopped_count(),
                        cycle_time_secs = report.cycle_time_secs,
                        "Completed CO2-based node optimization cycle, waiting for next cycle"
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(error = %e, "Cycle failed, retrying next cycle");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.cycle_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Control loop stopped");
        Ok(())
    }
}
