//! Cloud IDE control plane daemon
//!
//! Accepts browser connections, provisions a shell pod per workspace, and
//! bridges terminal connections to it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cide_controlplane::cluster::{MemoryCluster, MemoryConnector};
use cide_controlplane::{ControlPlaneState, Gateway};
use cide_core::config::{self, ClusterBackend, ControlPlaneConfig};
use cide_core::traits::ClusterConnector;

#[derive(Parser)]
#[command(name = "cide-controlplane")]
#[command(about = "Cloud IDE control plane daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Cluster backend: kubernetes or memory (overrides config)
    #[arg(long)]
    backend: Option<ClusterBackend>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn connector_for(backend: ClusterBackend) -> Result<Arc<dyn ClusterConnector>> {
    match backend {
        ClusterBackend::Memory => {
            tracing::warn!("Using the in-memory cluster; workspaces are simulated");
            let cluster = Arc::new(MemoryCluster::new().with_auto_ready(true));
            Ok(Arc::new(MemoryConnector::new(cluster)))
        }
        #[cfg(feature = "kube")]
        ClusterBackend::Kubernetes => Ok(Arc::new(cide_controlplane::cluster::KubeConnector)),
        #[cfg(not(feature = "kube"))]
        ClusterBackend::Kubernetes => anyhow::bail!(
            "the kubernetes backend requires building with `--features kube`; use `--backend memory`"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Cloud IDE control plane starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ControlPlaneConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ControlPlaneConfig::default()
        }
    };

    config.apply_env_overrides();
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    config.validate().context("Invalid configuration")?;

    cide_controlplane::cache::prepare_cache_dir(&config.cache_dir)
        .await
        .with_context(|| format!("Failed to create cache dir {:?}", config.cache_dir))?;

    let connector = connector_for(config.backend)?;
    let bind_addr = config.bind_address.clone();
    let state = Arc::new(ControlPlaneState::new(config, connector));

    // Setup signal handlers
    let cancel = state.shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });

    let gateway = Gateway::new(bind_addr, Arc::clone(&state));
    gateway.run().await?;

    tracing::info!("Control plane shutdown complete");
    Ok(())
}
