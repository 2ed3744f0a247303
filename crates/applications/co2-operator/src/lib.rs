//! # CO2 Operator
//!
//! Carbon-aware node lifecycle controller for Kubernetes.
//!
//! ## Architecture
//!
//! ```text
//! Controller (every 5 min)
//! ├── Cluster API       list nodes, (un)cordon, list pods, evict
//! ├── Emission          MOER per node (random walk or WattTime)
//! │   └── Metrics Store node locations, MOER/POWER samples (PostgreSQL)
//! ├── Selector          lowest-emission half stays schedulable
//! └── Lifecycle         allow / cordon + evict + drain wait + POWER bookkeeping
//! ```
//!
//! Each cycle ranks the nodes by their current marginal operating emissions
//! rate, keeps the cleaner half schedulable and drains the rest. A node is
//! only recorded as powered down once no workload is left on it.
//!
//! See [`controller`] and [`lifecycle`] modules for details.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod emission;
pub mod error;
pub mod forecast;
pub mod lifecycle;
pub mod select;
pub mod store;

#[cfg(test)]
mod testing;

// ============================================================================
// Public exports - Control loop
// ============================================================================

// Control loop
pub use controller::{Controller, ControllerConfig, CycleReport};

// Configuration
pub use config::{
    DEFAULT_CYCLE_INTERVAL_SECS, EmissionSource, OperatorConfig, parse_dry_run, parse_node_list,
};

// Node lifecycle
pub use lifecycle::{
    AllowResult, DEFAULT_DRAIN_POLL_SECS, DEFAULT_DRAIN_TIMEOUT_SECS, DrainResult, DrainStatus,
    LifecycleConfig, NodeLifecycleManager,
};

// Selection policy
pub use select::{NodeScore, Selection, select_nodes};

// ============================================================================
// Public exports - Core infrastructure
// ============================================================================

// Error handling
pub use error::{OperatorError, Result};

// Cluster access
pub use cluster::{ClusterApi, KubeCluster, Workload};

// Emission estimation
pub use emission::{
    EmissionEstimator, EmissionStrategy, MOER_MAX, MOER_MIN, MOER_SEED, RandomWalk, WalkState,
};
pub use forecast::WattTimeForecast;

// Metrics persistence
pub use store::{
    GeoBounds, Initialized, MemoryBackend, MetricKind, MetricSample, MetricsBackend, MetricsStore,
    NodeLocation, PgBackend,
};
