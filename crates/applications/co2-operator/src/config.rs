//! Operator configuration
//!
//! Everything the process needs to start, gathered from flags and the
//! environment by `main.rs` and checked by [`OperatorConfig::validate`].

use crate::controller::ControllerConfig;
use crate::error::{OperatorError, Result};
use crate::lifecycle::{DEFAULT_DRAIN_POLL_SECS, DEFAULT_DRAIN_TIMEOUT_SECS, LifecycleConfig};
use crate::store::GeoBounds;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default delay between cycles (5 minutes)
pub const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 300;

/// Where MOER values come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmissionSource {
    /// Bounded random walk
    #[default]
    RandomWalk,
    /// WattTime forecast API
    WattTime,
}

impl EmissionSource {
    /// Parse from a configuration value
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random-walk" | "random_walk" | "stub" => Some(Self::RandomWalk),
            "watttime" => Some(Self::WattTime),
            _ => None,
        }
    }
}

/// Parse a dry-run setting.
///
/// `All` (the Kubernetes API spelling), `true`, `1` and `yes` enable dry run;
/// an empty value, `None`, `false`, `0` and `no` disable it.
pub fn parse_dry_run(s: &str) -> std::result::Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "all" | "true" | "1" | "yes" => Ok(true),
        "" | "none" | "false" | "0" | "no" => Ok(false),
        other => Err(format!("invalid dry-run value '{other}', expected All or None")),
    }
}

/// Split a comma-separated node list, dropping blanks
pub fn parse_node_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Full operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Kubeconfig path; inferred when `None`
    pub kube_config_path: Option<PathBuf>,

    /// Metrics database connection string
    pub db_connection_string: String,

    /// Validate cluster mutations without committing them
    pub dry_run: bool,

    /// Score and record only, never actuate
    pub observe_only: bool,

    /// Nodes excluded from every decision
    pub ignored_nodes: Vec<String>,

    /// MOER source
    pub emission_source: EmissionSource,

    /// WattTime credentials (username, password)
    pub watttime_credentials: Option<(String, String)>,

    /// Delay between the end of one cycle and the start of the next
    pub cycle_interval: Duration,

    /// Bound on each node's drain wait
    pub drain_timeout: Duration,

    /// Interval between drain polls
    pub drain_poll_interval: Duration,

    /// Bounding box for synthetic node coordinates
    pub geo_bounds: GeoBounds,
}

impl OperatorConfig {
    /// Create a config for a database, with every other setting at its default
    pub fn new(db_connection_string: impl Into<String>) -> Self {
        Self {
            kube_config_path: None,
            db_connection_string: db_connection_string.into(),
            dry_run: false,
            observe_only: false,
            ignored_nodes: Vec::new(),
            emission_source: EmissionSource::default(),
            watttime_credentials: None,
            cycle_interval: Duration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            drain_poll_interval: Duration::from_secs(DEFAULT_DRAIN_POLL_SECS),
            geo_bounds: GeoBounds::default(),
        }
    }

    /// Set kubeconfig path
    pub fn with_kube_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.kube_config_path = Some(path.into());
        self
    }

    /// Set dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set observe-only mode
    pub fn with_observe_only(mut self, observe_only: bool) -> Self {
        self.observe_only = observe_only;
        self
    }

    /// Set ignored nodes
    pub fn with_ignored_nodes(mut self, nodes: Vec<String>) -> Self {
        self.ignored_nodes = nodes;
        self
    }

    /// Set emission source
    pub fn with_emission_source(mut self, source: EmissionSource) -> Self {
        self.emission_source = source;
        self
    }

    /// Set WattTime credentials
    pub fn with_watttime_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.watttime_credentials = Some((username.into(), password.into()));
        self
    }

    /// Set cycle interval
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    /// Set drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set drain poll interval
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Check that the configuration can be started
    pub fn validate(&self) -> Result<()> {
        if self.db_connection_string.trim().is_empty() {
            return Err(OperatorError::config("DB_CONNECTION_STRING is not set"));
        }
        if self.emission_source == EmissionSource::WattTime && self.watttime_credentials.is_none() {
            return Err(OperatorError::config(
                "WATTTIME_API_USERNAME and WATTTIME_API_PASSWORD are required \
                 for the watttime emission source",
            ));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(OperatorError::config("drain poll interval must be positive"));
        }
        if self.drain_poll_interval > self.drain_timeout {
            return Err(OperatorError::config(
                "drain poll interval must not exceed the drain timeout",
            ));
        }
        Ok(())
    }

    /// Lifecycle manager settings
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig::default()
            .with_dry_run(self.dry_run)
            .with_drain_timeout(self.drain_timeout)
            .with_poll_interval(self.drain_poll_interval)
    }

    /// Control loop settings
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig::default()
            .with_cycle_interval(self.cycle_interval)
            .with_ignored_nodes(self.ignored_nodes.clone())
            .with_observe_only(self.observe_only)
    }
}
