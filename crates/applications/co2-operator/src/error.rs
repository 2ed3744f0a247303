//! Error types for the operator

use thiserror::Error;

/// Operator result type
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur in the operator
#[derive(Error, Debug)]
pub enum OperatorError {
    /// PostgreSQL error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Metrics store error not raised by the database driver
    #[error("Store error: {0}")]
    Store(String),

    /// Cluster API error not raised by the Kubernetes client
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Forecast service error
    #[error("Forecast error: {0}")]
    Forecast(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OperatorError {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a cluster error
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a forecast error
    pub fn forecast(msg: impl Into<String>) -> Self {
        Self::Forecast(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error came from the metrics store.
    ///
    /// Store errors are never isolated per node; they end the current cycle.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Store(_))
    }

    /// Whether this error should stop the operator.
    ///
    /// Store and configuration errors (including rejected credentials) are
    /// fatal; cluster and forecast errors are retried on the next cycle.
    pub fn is_fatal(&self) -> bool {
        self.is_store() || matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_classification() {
        assert!(OperatorError::store("commit failed").is_store());
        assert!(OperatorError::Database(sqlx::Error::PoolTimedOut).is_store());
        assert!(!OperatorError::cluster("evict failed").is_store());
        assert!(!OperatorError::forecast("no data").is_store());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(OperatorError::store("commit failed").is_fatal());
        assert!(OperatorError::config("credentials rejected").is_fatal());
        assert!(!OperatorError::cluster("apiserver 503").is_fatal());
        assert!(!OperatorError::forecast("no data").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = OperatorError::config("DB_CONNECTION_STRING is not set");
        assert_eq!(
            err.to_string(),
            "Configuration error: DB_CONNECTION_STRING is not set"
        );
    }
}
