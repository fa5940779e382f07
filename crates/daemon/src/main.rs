//! MeshHub Daemon
//!
//! Peer mesh coordinator: discovery, membership and health, service registry
//! with short paths, DNS federation, load balancing, multi-point backup and
//! command broadcast.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod backup;
mod broadcast;
mod config;
mod discovery;
mod dns;
mod health;
mod lb;
mod membership;
mod registry;
mod server;
mod state;
mod transport;

use config::MeshConfig;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "meshhubd")]
#[command(about = "MeshHub daemon - peer mesh coordination")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.meshhub/config.toml")]
    config: PathBuf,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// UDP discovery port
    #[arg(short, long)]
    discovery_port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("MeshHub daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path = expand_home(&cli.config);
    let mut config = MeshConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.http_listen = listen;
    }
    if let Some(port) = cli.discovery_port {
        config.discovery_port = port;
    }

    tokio::fs::create_dir_all(&config.store_path).await?;
    let db = meshhub_common::Database::open(config.db_path())?;

    let transport = Arc::new(transport::HttpPeerTransport::new(Duration::from_secs(
        config.health.probe_timeout_seconds.max(5),
    ))?);
    let coordinator = Arc::new(state::Coordinator::new(config, db, transport)?);

    // Seed the zone from persisted state before serving.
    let entries = coordinator.registry.list().await;
    coordinator.dns.regenerate(&entries).await?;

    let shutdown = CancellationToken::new();

    let responder = tokio::spawn(discovery::run_responder(
        coordinator.config.discovery_port,
        coordinator.membership.local().clone(),
        shutdown.clone(),
    ));

    let monitor = Arc::new(health::HealthMonitor::new(
        coordinator.membership.clone(),
        coordinator.transport.clone(),
        coordinator.config.health.clone(),
    ));
    let monitor_handle = tokio::spawn(monitor.run(shutdown.clone()));

    let scheduler_handle =
        tokio::spawn(coordinator.backup.clone().run_scheduler(shutdown.clone()));

    let server_handle = tokio::spawn(server::serve(coordinator.clone()));

    info!("daemon started on {}", coordinator.config.http_listen);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    shutdown.cancel();
    let _ = responder.await;
    let _ = monitor_handle.await;
    let _ = scheduler_handle.await;

    info!("daemon shutdown complete");
    Ok(())
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
