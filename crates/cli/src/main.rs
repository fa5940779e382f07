//! MeshHub CLI - Main Entry Point
//!
//! Command-line interface for a MeshHub coordinator: peers, services,
//! registry, DNS federation, load balancing, backups and broadcasts.

use clap::{Parser, Subcommand};

mod client;
mod commands;
mod output;

use commands::{backup, broadcast, dns, lb, peer, registry, service, settings};

/// MeshHub CLI - Peer Mesh Coordinator
#[derive(Parser)]
#[command(name = "meshhub")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Coordinator address
    #[arg(long, default_value = "http://127.0.0.1:8787", global = true)]
    addr: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage mesh peers
    #[command(subcommand)]
    Peer(peer::PeerCommands),

    /// Manage local and mesh services
    #[command(subcommand)]
    Service(service::ServiceCommands),

    /// Manage the short-path registry
    #[command(subcommand)]
    Registry(registry::RegistryCommands),

    /// Inspect and sync the mesh DNS zone
    #[command(subcommand)]
    Dns(dns::DnsCommands),

    /// Load balancing across shared services
    #[command(subcommand)]
    Lb(lb::LbCommands),

    /// Multi-point backups
    #[command(subcommand)]
    Backup(backup::BackupCommands),

    /// Fan commands out to peers
    #[command(subcommand)]
    Broadcast(broadcast::BroadcastCommands),

    /// Coordinator settings
    #[command(subcommand)]
    Settings(settings::SettingsCommands),

    /// Check coordinator status
    Status,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let client = client::ApiClient::new(&cli.addr)?;

    match cli.command {
        Commands::Peer(cmd) => peer::execute(cmd, client, cli.format).await?,
        Commands::Service(cmd) => service::execute(cmd, client, cli.format).await?,
        Commands::Registry(cmd) => registry::execute(cmd, client, cli.format).await?,
        Commands::Dns(cmd) => dns::execute(cmd, client, cli.format).await?,
        Commands::Lb(cmd) => lb::execute(cmd, client, cli.format).await?,
        Commands::Backup(cmd) => backup::execute(cmd, client, cli.format).await?,
        Commands::Broadcast(cmd) => broadcast::execute(cmd, client, cli.format).await?,
        Commands::Settings(cmd) => settings::execute(cmd, client, cli.format).await?,
        Commands::Status => match client.health().await {
            Ok(summary) => {
                println!(
                    "✅ Coordinator '{}' is running at {} ({} online / {} degraded / {} offline peers)",
                    summary.node.name,
                    cli.addr,
                    summary.peers_online,
                    summary.peers_degraded,
                    summary.peers_offline
                );
            }
            Err(e) => {
                output::print_error(&format!("Coordinator is not responding at {}: {}", cli.addr, e));
                std::process::exit(1);
            }
        },
        Commands::Version => {
            println!("meshhub {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
