//! Metrics and location persistence
//!
//! Durable log of node geocoordinates and time-stamped POWER/MOER samples.
//! The store is the operator's only memory across cycles and the source of
//! truth for whether a node is *believed* to be running.
//!
//! ## Layout
//!
//! ```text
//! MetricsStore (get-or-initialise reads, coordinate synthesis)
//!     │
//!     └── dyn MetricsBackend
//!             ├── PgBackend      (PostgreSQL, production)
//!             └── MemoryBackend  (tests, embedding)
//! ```
//!
//! Samples are append-only. Nothing is updated or deleted except by
//! [`MetricsStore::reset_schema`], which drops and recreates everything.
//! There is no locking: two operator instances sharing a database race.

pub mod memory;
pub mod postgres;

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

/// Kind of metric sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricKind {
    /// Marginal operating emissions rate estimate
    Moer,
    /// Power-state bookkeeping (`> 0` running, `0` stopped)
    Power,
}

impl MetricKind {
    /// Name as stored in the `value_type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Moer => "MOER",
            Self::Power => "POWER",
        }
    }

    /// Parse from the stored column value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MOER" => Some(Self::Moer),
            "POWER" => Some(Self::Power),
            _ => None,
        }
    }
}

/// A single time-stamped metric value for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Node the sample belongs to
    pub node_name: String,
    /// Sample kind
    pub kind: MetricKind,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Sample value
    pub value: f64,
}

impl MetricSample {
    /// Create a sample
    pub fn new(
        node_name: impl Into<String>,
        kind: MetricKind,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            kind,
            timestamp,
            value,
        }
    }
}

/// Geographic coordinates assigned to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLocation {
    /// Node name (unique)
    pub node_name: String,
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
}

/// Value returned by a read that initialises missing state.
///
/// `created` is true when the read had to write the value first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Initialized<T> {
    /// The value read (or written)
    pub value: T,
    /// Whether the value was created by this call
    pub created: bool,
}

impl<T> Initialized<T> {
    /// A value that already existed
    pub fn existing(value: T) -> Self {
        Self {
            value,
            created: false,
        }
    }

    /// A value created by this call
    pub fn created(value: T) -> Self {
        Self {
            value,
            created: true,
        }
    }
}

/// Bounding box that synthetic node coordinates are drawn from
#[derive(Debug, Clone, PartialEq)]
pub struct GeoBounds {
    /// Latitude range (degrees)
    pub lat: Range<f64>,
    /// Longitude range (degrees)
    pub lng: Range<f64>,
}

impl GeoBounds {
    /// Create bounds from latitude and longitude ranges
    pub fn new(lat: Range<f64>, lng: Range<f64>) -> Self {
        Self { lat, lng }
    }

    /// Roughly the extent of Europe
    pub fn europe() -> Self {
        Self::new(34.5..71.2, -31.3..42.0)
    }

    /// Whether a coordinate lies inside the bounds
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        self.lat.contains(&lat) && self.lng.contains(&lng)
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, f64) {
        (
            rng.gen_range(self.lat.clone()),
            rng.gen_range(self.lng.clone()),
        )
    }
}

impl Default for GeoBounds {
    fn default() -> Self {
        Self::europe()
    }
}

/// Storage backend for locations and samples.
///
/// Every write is committed before the returned future resolves.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Drop and recreate all tables
    async fn reset_schema(&self) -> Result<()>;

    /// Append a sample
    async fn insert_sample(&self, sample: &MetricSample) -> Result<()>;

    /// Most recent sample of `kind` for `node`, by timestamp
    async fn latest_sample(&self, node: &str, kind: MetricKind) -> Result<Option<MetricSample>>;

    /// Stored location for `node`
    async fn location(&self, node: &str) -> Result<Option<NodeLocation>>;

    /// Persist a location
    async fn insert_location(&self, location: &NodeLocation) -> Result<()>;
}

/// Metrics store used by the estimator and lifecycle manager
pub struct MetricsStore {
    backend: Arc<dyn MetricsBackend>,
    bounds: GeoBounds,
    rng: Mutex<StdRng>,
}

impl MetricsStore {
    /// Create a store over a backend, drawing coordinates from `bounds`
    pub fn new(backend: Arc<dyn MetricsBackend>, bounds: GeoBounds) -> Self {
        Self::with_rng(backend, bounds, StdRng::from_entropy())
    }

    /// Create a store with an explicit RNG for coordinate synthesis
    pub fn with_rng(backend: Arc<dyn MetricsBackend>, bounds: GeoBounds, rng: StdRng) -> Self {
        Self {
            backend,
            bounds,
            rng: Mutex::new(rng),
        }
    }

    /// Destructive bootstrap. Run exactly once at process start.
    pub async fn reset_schema(&self) -> Result<()> {
        info!("Setting up database...");
        self.backend.reset_schema().await?;
        info!("Database setup complete");
        Ok(())
    }

    /// Append a sample with an explicit timestamp
    pub async fn record_sample(
        &self,
        node: &str,
        kind: MetricKind,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        debug!(node = %node, kind = kind.as_str(), value, "Recording sample");
        self.backend
            .insert_sample(&MetricSample::new(node, kind, value, timestamp))
            .await
    }

    /// Append a sample stamped with the current time
    pub async fn record(&self, node: &str, kind: MetricKind, value: f64) -> Result<()> {
        self.record_sample(node, kind, value, Utc::now()).await
    }

    /// Stored coordinates for `node`, synthesising and persisting them on first use
    pub async fn get_or_create_location(&self, node: &str) -> Result<Initialized<NodeLocation>> {
        if let Some(location) = self.backend.location(node).await? {
            return Ok(Initialized::existing(location));
        }

        let (lat, lng) = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| OperatorError::store("coordinate RNG poisoned"))?;
            self.bounds.sample(&mut *rng)
        };

        let location = NodeLocation {
            node_name: node.to_string(),
            lat,
            lng,
        };
        self.backend.insert_location(&location).await?;

        debug!(node = %node, lat, lng, "Assigned node location");
        Ok(Initialized::created(location))
    }

    /// Whether the node is believed to be running.
    ///
    /// A node with no POWER history is recorded as running (POWER=1) and
    /// reported with `created = true`.
    pub async fn is_running(&self, node: &str) -> Result<Initialized<bool>> {
        match self.backend.latest_sample(node, MetricKind::Power).await? {
            Some(sample) => Ok(Initialized::existing(sample.value > 0.0)),
            None => {
                self.record(node, MetricKind::Power, 1.0).await?;
                Ok(Initialized::created(true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Arc<MemoryBackend>, MetricsStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = MetricsStore::with_rng(
            backend.clone(),
            GeoBounds::europe(),
            StdRng::seed_from_u64(7),
        );
        (backend, store)
    }

    #[test]
    fn test_metric_kind_column_names() {
        assert_eq!(MetricKind::Moer.as_str(), "MOER");
        assert_eq!(MetricKind::parse("POWER"), Some(MetricKind::Power));
        assert_eq!(MetricKind::parse("power"), None);
    }

    #[tokio::test]
    async fn test_location_is_created_once() {
        let (_, store) = store();

        let first = store.get_or_create_location("node-a").await.unwrap();
        let second = store.get_or_create_location("node-a").await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.value, second.value);
        assert!(GeoBounds::europe().contains(first.value.lat, first.value.lng));
    }

    #[tokio::test]
    async fn test_locations_differ_per_node() {
        let (_, store) = store();

        let a = store.get_or_create_location("node-a").await.unwrap().value;
        let b = store.get_or_create_location("node-b").await.unwrap().value;

        assert_eq!(a.node_name, "node-a");
        assert_eq!(b.node_name, "node-b");
        assert_ne!((a.lat, a.lng), (b.lat, b.lng));
    }

    #[tokio::test]
    async fn test_is_running_initialises_fresh_node() {
        let (backend, store) = store();

        let running = store.is_running("node-a").await.unwrap();

        assert!(running.value);
        assert!(running.created);
        let power = backend.samples_for("node-a", MetricKind::Power);
        assert_eq!(power.len(), 1);
        assert_eq!(power[0].value, 1.0);

        let again = store.is_running("node-a").await.unwrap();
        assert!(again.value);
        assert!(!again.created);
        assert_eq!(backend.samples_for("node-a", MetricKind::Power).len(), 1);
    }

    #[tokio::test]
    async fn test_is_running_follows_latest_power_sample() {
        let (_, store) = store();
        let t0 = Utc::now();

        store
            .record_sample("node-a", MetricKind::Power, 1.0, t0)
            .await
            .unwrap();
        store
            .record_sample("node-a", MetricKind::Power, 0.0, t0 + chrono::Duration::seconds(5))
            .await
            .unwrap();
        // MOER samples never affect run-state
        store
            .record_sample("node-a", MetricKind::Moer, 60.0, t0 + chrono::Duration::seconds(9))
            .await
            .unwrap();

        let running = store.is_running("node-a").await.unwrap();
        assert!(!running.value);
        assert!(!running.created);
    }
}
