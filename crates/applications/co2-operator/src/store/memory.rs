//! In-process metrics backend
//!
//! Keeps everything in memory, for tests and for embedding the store where
//! no database is wanted. Nothing survives the process.

use super::{MetricKind, MetricSample, MetricsBackend, NodeLocation};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    locations: HashMap<String, NodeLocation>,
    samples: Vec<MetricSample>,
}

/// Metrics backend held in memory
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, as a lost database connection would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All samples in insertion order
    pub fn samples(&self) -> Vec<MetricSample> {
        self.lock().map(|t| t.samples.clone()).unwrap_or_default()
    }

    /// Samples of one kind for one node, in insertion order
    pub fn samples_for(&self, node: &str, kind: MetricKind) -> Vec<MetricSample> {
        self.samples()
            .into_iter()
            .filter(|s| s.node_name == node && s.kind == kind)
            .collect()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OperatorError::store("backend unavailable"));
        }
        self.tables
            .lock()
            .map_err(|_| OperatorError::store("memory backend poisoned"))
    }
}

#[async_trait]
impl MetricsBackend for MemoryBackend {
    async fn reset_schema(&self) -> Result<()> {
        *self.lock()? = Tables::default();
        Ok(())
    }

    async fn insert_sample(&self, sample: &MetricSample) -> Result<()> {
        self.lock()?.samples.push(sample.clone());
        Ok(())
    }

    async fn latest_sample(&self, node: &str, kind: MetricKind) -> Result<Option<MetricSample>> {
        let tables = self.lock()?;
        // Later inserts win timestamp ties
        let latest = tables
            .samples
            .iter()
            .filter(|s| s.node_name == node && s.kind == kind)
            .fold(None::<&MetricSample>, |best, s| match best {
                Some(b) if b.timestamp > s.timestamp => Some(b),
                _ => Some(s),
            });
        Ok(latest.cloned())
    }

    async fn location(&self, node: &str) -> Result<Option<NodeLocation>> {
        Ok(self.lock()?.locations.get(node).cloned())
    }

    async fn insert_location(&self, location: &NodeLocation) -> Result<()> {
        self.lock()?
            .locations
            .insert(location.node_name.clone(), location.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_latest_sample_prefers_later_insert_on_tie() {
        let backend = MemoryBackend::new();
        let t = Utc::now();

        backend
            .insert_sample(&MetricSample::new("n", MetricKind::Power, 1.0, t))
            .await
            .unwrap();
        backend
            .insert_sample(&MetricSample::new("n", MetricKind::Power, 0.0, t))
            .await
            .unwrap();

        let latest = backend.latest_sample("n", MetricKind::Power).await.unwrap();
        assert_eq!(latest.unwrap().value, 0.0);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let backend = MemoryBackend::new();
        backend
            .insert_sample(&MetricSample::new("n", MetricKind::Moer, 50.0, Utc::now()))
            .await
            .unwrap();
        backend
            .insert_location(&NodeLocation {
                node_name: "n".to_string(),
                lat: 50.0,
                lng: 8.0,
            })
            .await
            .unwrap();

        backend.reset_schema().await.unwrap();

        assert!(backend.samples().is_empty());
        assert!(backend.location("n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_every_call() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);

        let err = backend.location("n").await.unwrap_err();
        assert!(err.is_store());
        assert!(backend
            .insert_sample(&MetricSample::new("n", MetricKind::Moer, 50.0, Utc::now()))
            .await
            .is_err());
    }
}
