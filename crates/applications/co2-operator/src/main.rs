//! co2-operator - carbon-aware node lifecycle controller
//!
//! ## Usage
//!
//! ```bash
//! # Production: reset the metrics schema, then run the control loop
//! DB_CONNECTION_STRING=postgres://... co2-operator
//!
//! # Validate every cluster mutation server-side without committing it
//! co2-operator --dry-run All
//!
//! # Score and record only, never touch the cluster
//! co2-operator --observe-only --ignored-node-names control-plane
//! ```
//!
//! Every flag can also be set through its environment variable. `.env` and
//! `.env.local` in the working directory are read first.

use anyhow::Context;
use clap::Parser;
use co2_operator::{
    Controller, DEFAULT_CYCLE_INTERVAL_SECS, DEFAULT_DRAIN_POLL_SECS, DEFAULT_DRAIN_TIMEOUT_SECS,
    EmissionEstimator, EmissionSource, EmissionStrategy, KubeCluster, MetricsStore,
    NodeLifecycleManager, OperatorConfig, PgBackend, RandomWalk, WattTimeForecast, parse_dry_run,
    parse_node_list,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// co2-operator: keep the lowest-emission half of a cluster schedulable
#[derive(Parser)]
#[command(name = "co2-operator")]
#[command(about = "Carbon-aware node lifecycle controller for Kubernetes", long_about = None)]
struct Cli {
    /// Kubeconfig file (default: in-cluster config, KUBECONFIG or ~/.kube/config)
    #[arg(long = "kube-config", env = "KUBE_CONFIG_PATH")]
    kube_config: Option<PathBuf>,

    /// Server-side dry run for cluster mutations (All or None)
    #[arg(
        long,
        env = "DRY_RUN",
        default_value = "None",
        value_parser = parse_dry_run,
        action = clap::ArgAction::Set
    )]
    dry_run: bool,

    /// PostgreSQL connection string for the metrics store
    #[arg(long, env = "DB_CONNECTION_STRING", hide_env_values = true)]
    db_connection_string: String,

    /// WattTime API username (watttime emission source only)
    #[arg(long, env = "WATTTIME_API_USERNAME")]
    watttime_username: Option<String>,

    /// WattTime API password (watttime emission source only)
    #[arg(long, env = "WATTTIME_API_PASSWORD", hide_env_values = true)]
    watttime_password: Option<String>,

    /// Emission source (random-walk, watttime)
    #[arg(
        long,
        env = "EMISSION_SOURCE",
        default_value = "random-walk",
        value_parser = parse_emission_source
    )]
    emission_source: EmissionSource,

    /// Comma-separated node names excluded from every decision
    #[arg(long, env = "IGNORED_NODE_NAMES", default_value = "")]
    ignored_node_names: String,

    /// Score and record nodes without touching the cluster
    #[arg(long, env = "OBSERVE_ONLY")]
    observe_only: bool,

    /// Delay between cycles (seconds)
    #[arg(long, env = "CYCLE_INTERVAL_SECS", default_value_t = DEFAULT_CYCLE_INTERVAL_SECS)]
    cycle_interval_secs: u64,

    /// Bound on each node's drain wait (seconds)
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = DEFAULT_DRAIN_TIMEOUT_SECS)]
    drain_timeout_secs: u64,

    /// Interval between drain polls (seconds)
    #[arg(long, env = "DRAIN_POLL_SECS", default_value_t = DEFAULT_DRAIN_POLL_SECS)]
    drain_poll_secs: u64,
}

impl Cli {
    fn into_config(self) -> OperatorConfig {
        let mut config = OperatorConfig::new(self.db_connection_string)
            .with_dry_run(self.dry_run)
            .with_observe_only(self.observe_only)
            .with_ignored_nodes(parse_node_list(&self.ignored_node_names))
            .with_emission_source(self.emission_source)
            .with_cycle_interval(Duration::from_secs(self.cycle_interval_secs))
            .with_drain_timeout(Duration::from_secs(self.drain_timeout_secs))
            .with_drain_poll_interval(Duration::from_secs(self.drain_poll_secs));

        if let Some(path) = self.kube_config {
            config = config.with_kube_config(path);
        }
        if let (Some(username), Some(password)) = (self.watttime_username, self.watttime_password) {
            config = config.with_watttime_credentials(username, password);
        }
        config
    }
}

fn parse_emission_source(s: &str) -> Result<EmissionSource, String> {
    EmissionSource::parse(s)
        .ok_or_else(|| format!("unknown emission source '{s}', expected random-walk or watttime"))
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                        _ = terminate.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Cannot install SIGTERM handler, listening for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }

        info!("Shutting down...");
        token.cancel();
    });
}

fn emission_strategy(config: &OperatorConfig) -> anyhow::Result<Box<dyn EmissionStrategy>> {
    match (config.emission_source, &config.watttime_credentials) {
        (EmissionSource::WattTime, Some((username, password))) => Ok(Box::new(
            WattTimeForecast::new(username.as_str(), password.as_str())
                .context("Failed to create WattTime client")?,
        )),
        _ => Ok(Box::new(RandomWalk::new())),
    }
}

async fn run(config: OperatorConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    config.validate()?;

    info!(
        dry_run = config.dry_run,
        observe_only = config.observe_only,
        emission_source = ?config.emission_source,
        "Starting co2-operator"
    );

    let backend = PgBackend::connect(&config.db_connection_string)
        .await
        .context("Failed to connect to the metrics database")?;
    let store = Arc::new(MetricsStore::new(Arc::new(backend), config.geo_bounds.clone()));
    store.reset_schema().await.context("Failed to set up the metrics schema")?;

    let cluster = Arc::new(
        KubeCluster::connect(config.kube_config_path.as_deref())
            .await
            .context("Failed to connect to the cluster")?,
    );

    let estimator = EmissionEstimator::new(store.clone(), emission_strategy(&config)?);
    let lifecycle = NodeLifecycleManager::new(cluster.clone(), store, config.lifecycle());
    let mut controller = Controller::new(cluster, estimator, lifecycle, config.controller());

    controller.run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    dotenvy::from_filename(".env.local").ok();

    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "co2_operator=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();

    let config = Cli::parse().into_config();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    if let Err(e) = run(config, shutdown).await {
        error!(error = %format!("{e:#}"), "co2-operator stopped");
        return Err(e);
    }
    Ok(())
}
