//! Per-node emission estimation
//!
//! Produces the MOER proxy used to rank nodes. Values only need to be
//! comparable with each other within a cycle; absolute accuracy is not a goal.
//!
//! ## Strategies
//!
//! - **RandomWalk** (default): bounded random walk per node, `clamp(v + step, 25, 75)`
//!   with `step ∈ {-4, -2, 2, 4}`, seeded at 50
//! - **WattTimeForecast**: zero-horizon forecast for the node's grid region
//!   (see [`crate::forecast`])
//!
//! Whatever the strategy, [`EmissionEstimator::estimate`] records every value
//! it returns as a MOER sample.

use crate::error::Result;
use crate::store::{MetricKind, MetricsStore, NodeLocation};
use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Starting MOER value for a node seen for the first time
pub const MOER_SEED: f64 = 50.0;

/// Lower bound of random-walk values
pub const MOER_MIN: f64 = 25.0;

/// Upper bound of random-walk values
pub const MOER_MAX: f64 = 75.0;

/// Possible random-walk steps
const WALK_STEPS: [f64; 4] = [-4.0, -2.0, 2.0, 4.0];

/// Source of MOER values for a node
#[async_trait]
pub trait EmissionStrategy: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// MOER value for the node at `location`
    async fn moer(&mut self, location: &NodeLocation) -> Result<f64>;
}

/// Last emitted value per node.
///
/// Lives only as long as the process; a restart puts every node back at the seed.
#[derive(Debug, Clone, Default)]
pub struct WalkState {
    values: HashMap<String, f64>,
}

impl WalkState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value emitted for `node`, if any
    pub fn get(&self, node: &str) -> Option<f64> {
        self.values.get(node).copied()
    }

    /// Apply `step` to the node's value and return the clamped result
    pub fn advance(&mut self, node: &str, step: f64) -> f64 {
        let current = self.get(node).unwrap_or(MOER_SEED);
        let next = (current + step).clamp(MOER_MIN, MOER_MAX);
        self.values.insert(node.to_string(), next);
        next
    }
}

/// Bounded random walk standing in for a live forecast
pub struct RandomWalk {
    state: WalkState,
    rng: StdRng,
}

impl RandomWalk {
    /// Create a walk seeded from OS entropy
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a walk with an explicit RNG
    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            state: WalkState::new(),
            rng,
        }
    }

    /// Current walk state
    pub fn state(&self) -> &WalkState {
        &self.state
    }

    /// Take one step for `node`
    pub fn step(&mut self, node: &str) -> f64 {
        let step = *WALK_STEPS.choose(&mut self.rng).unwrap_or(&0.0);
        self.state.advance(node, step)
    }
}

impl Default for RandomWalk {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmissionStrategy for RandomWalk {
    fn name(&self) -> &'static str {
        "random-walk"
    }

    async fn moer(&mut self, location: &NodeLocation) -> Result<f64> {
        Ok(self.step(&location.node_name))
    }
}

/// Scores nodes and records every score
pub struct EmissionEstimator {
    store: Arc<MetricsStore>,
    strategy: Box<dyn EmissionStrategy>,
}

impl EmissionEstimator {
    /// Create an estimator using `strategy`
    pub fn new(store: Arc<MetricsStore>, strategy: Box<dyn EmissionStrategy>) -> Self {
        Self { store, strategy }
    }

    /// Name of the active strategy
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Estimate the node's MOER value and record it as a sample
    pub async fn estimate(&mut self, node: &str) -> Result<f64> {
        let location = self.store.get_or_create_location(node).await?.value;
        let moer = self.strategy.moer(&location).await?;

        self.store.record(node, MetricKind::Moer, moer).await?;

        debug!(
            node = %node,
            moer,
            strategy = self.strategy.name(),
            "Estimated emission rate"
        );
        Ok(moer)
    }
}
