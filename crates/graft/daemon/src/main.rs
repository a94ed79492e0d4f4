//! graftd - background daemon mirroring a workspace-local tracking server
//! into a durable relational mirror and a cluster-wide platform server.
//!
//! The daemon wires three reconciliation stages, chained through flags
//! persisted on mirror rows:
//! - experiments: discover source experiments, mirror and materialize them
//! - runs: push runs of flagged experiments to the platform
//! - metrics: fold platform metrics and artifacts into mirror rows

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use graft_store::{MemoryStore, MirrorStore, PostgresStore};
use graft_sync::ReconcilerSet;
use graft_tracking::{HttpTrackingStore, TrackingPair};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;

use config::{GraftConfig, StorageConfig, TrackingEndpoint};
use error::{DaemonError, DaemonResult};

/// Graft daemon CLI
#[derive(Parser)]
#[command(name = "graftd")]
#[command(about = "Graft - tracking-server mirror daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GRAFT_CONFIG")]
    config: Option<String>,

    /// Log level (overrides the config file)
    #[arg(long, env = "GRAFT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "GRAFT_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    let config =
        GraftConfig::load(cli.config.as_deref()).map_err(|e| DaemonError::Config(e.to_string()))?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        local = %config.local.url,
        remote = %config.remote.url,
        "graftd starting"
    );

    let store = build_store(&config.storage).await?;
    let tracking = build_tracking(&config)?;

    let mut set = ReconcilerSet::new(
        store,
        tracking,
        &config.experiments,
        &config.runs,
        &config.metrics,
    )
    .await
    .map_err(|e| DaemonError::Sync(e.to_string()))?;
    if set.is_empty() {
        return Err(DaemonError::Config(
            "all reconciliation stages are disabled".to_string(),
        ));
    }
    set.start();

    shutdown_signal().await;

    tracing::info!("draining reconcilers");
    set.finish().await;
    tracing::info!("graftd stopped");

    Ok(())
}

async fn build_store(storage: &StorageConfig) -> DaemonResult<Arc<dyn MirrorStore>> {
    match storage {
        StorageConfig::Memory => {
            tracing::warn!("using in-memory storage, the mirror will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store = PostgresStore::connect_with_options(
                url,
                *max_connections,
                Duration::from_secs(*connect_timeout_secs),
            )
            .await
            .map_err(|e| DaemonError::Storage(e.to_string()))?;
            store
                .init_schema()
                .await
                .map_err(|e| DaemonError::Storage(e.to_string()))?;
            Ok(Arc::new(store))
        }
    }
}

fn build_tracking(config: &GraftConfig) -> DaemonResult<TrackingPair> {
    Ok(TrackingPair::new(
        Arc::new(build_client(&config.local)?),
        Arc::new(build_client(&config.remote)?),
    ))
}

fn build_client(endpoint: &TrackingEndpoint) -> DaemonResult<HttpTrackingStore> {
    let mut client = HttpTrackingStore::new(endpoint.url.as_str())
        .map_err(|e| DaemonError::Tracking(e.to_string()))?;
    if let Some(token) = &endpoint.bearer_token {
        client = client.with_bearer_token(token.as_str());
    }
    Ok(client)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
