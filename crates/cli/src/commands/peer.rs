//! Peer commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;

use crate::client::ApiClient;
use crate::commands::format_epoch;
use crate::output::{print_item, print_list, print_success, OutputFormat, TableDisplay};
use meshhub_common::{Peer, PeerStatus};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// List known peers
    List,

    /// Get peer details
    Get {
        /// Peer ID
        id: String,
    },

    /// Add a peer by address
    Add {
        /// Peer API address (host:port)
        address: String,

        /// Display name (defaults to the peer's announced name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Remove a peer
    Remove {
        /// Peer ID
        id: String,
    },

    /// Probe the local network for coordinators
    Discover {
        /// Collection window in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[derive(Serialize)]
pub struct PeerDisplay {
    pub id: String,
    pub name: String,
    pub address: String,
    pub status: String,
    pub services: u32,
    pub last_seen: String,
}

impl From<Peer> for PeerDisplay {
    fn from(peer: Peer) -> Self {
        let status = match peer.status {
            PeerStatus::Online => "online".green().to_string(),
            PeerStatus::Degraded => "degraded".yellow().to_string(),
            PeerStatus::Offline => "offline".red().to_string(),
        };
        Self {
            id: peer.id,
            name: peer.name,
            address: peer.address,
            status,
            services: peer.services_count,
            last_seen: format_epoch(peer.last_seen),
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Address", "Status", "Services", "Last Seen"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.address.clone(),
            self.status.clone(),
            self.services.to_string(),
            self.last_seen.clone(),
        ]
    }
}

pub async fn execute(cmd: PeerCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        PeerCommands::List => {
            let peers = client.list_peers().await?;
            let displays: Vec<PeerDisplay> = peers.into_iter().map(PeerDisplay::from).collect();
            print_list(&displays, format);
        }

        PeerCommands::Get { id } => {
            let peers = client.list_peers().await?;
            match peers.into_iter().find(|p| p.id == id) {
                Some(peer) => print_item(&PeerDisplay::from(peer), format),
                None => anyhow::bail!("peer not found: {}", id),
            }
        }

        PeerCommands::Add { address, name } => {
            let peer = client.add_peer(&address, name).await?;
            print_success(&format!("Peer '{}' added ({})", peer.name, peer.id));
            print_item(&PeerDisplay::from(peer), format);
        }

        PeerCommands::Remove { id } => {
            client.remove_peer(&id).await?;
            print_success(&format!("Peer '{}' removed", id));
        }

        PeerCommands::Discover { timeout } => {
            let found = client.discover(timeout).await?;
            print_success(&format!("{} peer(s) answered", found.len()));
            let displays: Vec<PeerDisplay> =
                found.into_iter().map(PeerDisplay::from).collect();
            print_list(&displays, format);
        }
    }
    Ok(())
}
