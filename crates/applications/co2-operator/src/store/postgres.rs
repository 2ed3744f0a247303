//! PostgreSQL metrics backend
//!
//! Two tables, reset on every start:
//!
//! ```text
//! node_infos           (node_name PK, lat, lng)
//! node_metric_entries  (id, node_name, value_type ∈ {MOER, POWER}, timestamp, value)
//! ```
//!
//! Timestamps are stored as UTC in a zone-less `TIMESTAMP` column. `id` is an
//! insertion sequence: on equal timestamps, or after the wall clock steps
//! back, the later insert is the latest sample.

use super::{MetricKind, MetricSample, MetricsBackend, NodeLocation};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

/// Statements run by [`PgBackend::reset_schema`], in order
const SCHEMA_RESET: &[&str] = &[
    "DROP TABLE IF EXISTS node_infos",
    "CREATE TABLE node_infos (node_name VARCHAR(255) PRIMARY KEY, lat FLOAT, lng FLOAT)",
    "DROP TABLE IF EXISTS node_metric_entries",
    "DROP TYPE IF EXISTS value_type",
    "CREATE TYPE value_type AS ENUM ('MOER', 'POWER')",
    "CREATE TABLE node_metric_entries (id BIGSERIAL PRIMARY KEY, node_name VARCHAR(255), \
     value_type value_type, timestamp TIMESTAMP, value FLOAT)",
];

const INSERT_SAMPLE: &str = "INSERT INTO node_metric_entries \
     (node_name, timestamp, value_type, value) \
     VALUES ($1, $2, $3::value_type, $4)";

const SELECT_LATEST_SAMPLE: &str = "SELECT node_name, value_type::text, timestamp, value \
     FROM node_metric_entries \
     WHERE node_name = $1 AND value_type = $2::value_type \
     ORDER BY timestamp DESC, id DESC LIMIT 1";

const SELECT_LOCATION: &str = "SELECT node_name, lat, lng FROM node_infos WHERE node_name = $1";

const INSERT_LOCATION: &str = "INSERT INTO node_infos (node_name, lat, lng) VALUES ($1, $2, $3)";

/// Metrics backend on a PostgreSQL database
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect to the database.
    ///
    /// The operator is strictly sequential, so one connection is enough.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        debug!("Connecting to metrics database");
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(connection_string)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsBackend for PgBackend {
    async fn reset_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for &statement in SCHEMA_RESET {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_sample(&self, sample: &MetricSample) -> Result<()> {
        sqlx::query(INSERT_SAMPLE)
            .bind(&sample.node_name)
            .bind(sample.timestamp.naive_utc())
            .bind(sample.kind.as_str())
            .bind(sample.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_sample(&self, node: &str, kind: MetricKind) -> Result<Option<MetricSample>> {
        let row: Option<(String, String, NaiveDateTime, f64)> =
            sqlx::query_as(SELECT_LATEST_SAMPLE)
                .bind(node)
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(node_name, kind, timestamp, value)| -> Result<MetricSample> {
            let kind = MetricKind::parse(&kind)
                .ok_or_else(|| OperatorError::store(format!("unknown value_type {kind}")))?;
            Ok(MetricSample {
                node_name,
                kind,
                timestamp: Utc.from_utc_datetime(&timestamp),
                value,
            })
        })
        .transpose()
    }

    async fn location(&self, node: &str) -> Result<Option<NodeLocation>> {
        let row: Option<(String, f64, f64)> = sqlx::query_as(SELECT_LOCATION)
            .bind(node)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(node_name, lat, lng)| NodeLocation { node_name, lat, lng }))
    }

    async fn insert_location(&self, location: &NodeLocation) -> Result<()> {
        sqlx::query(INSERT_LOCATION)
            .bind(&location.node_name)
            .bind(location.lat)
            .bind(location.lng)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_reset_drops_before_creating() {
        let drop_type = SCHEMA_RESET
            .iter()
            .position(|s| s.starts_with("DROP TYPE"))
            .unwrap();
        let create_type = SCHEMA_RESET
            .iter()
            .position(|s| s.starts_with("CREATE TYPE"))
            .unwrap();
        let drop_entries = SCHEMA_RESET
            .iter()
            .position(|s| *s == "DROP TABLE IF EXISTS node_metric_entries")
            .unwrap();

        // The enum can only be dropped once no table uses it
        assert!(drop_entries < drop_type);
        assert!(drop_type < create_type);
    }

    #[test]
    fn test_latest_sample_query_breaks_ties_by_insert_order() {
        assert!(SELECT_LATEST_SAMPLE.contains("ORDER BY timestamp DESC, id DESC LIMIT 1"));

        let create_entries = SCHEMA_RESET
            .iter()
            .find(|s| s.starts_with("CREATE TABLE node_metric_entries"))
            .unwrap();
        assert!(create_entries.contains("id BIGSERIAL"));
    }
}
