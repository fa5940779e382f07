//! Registry commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::client::ApiClient;
use crate::output::{print_item, print_list, print_success, print_value, OutputFormat, TableDisplay};
use meshhub_common::{RegistryEntry, RegistryKind};

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// List registry entries
    List,

    /// Publish a short path
    Publish {
        /// Short path (e.g. "nas" or "media/films")
        short_path: String,

        /// Target address or service name
        target: String,

        /// Entry kind
        #[arg(short, long, default_value = "proxy")]
        kind: String,

        /// Cache TTL in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Remove a locally owned short path
    Unpublish {
        /// Short path
        short_path: String,
    },

    /// Resolve a short path
    Resolve {
        /// Short path
        short_path: String,
    },

    /// Pull registry snapshots from all peers and merge
    Sync,

    /// Expire every cached entry
    Flush,
}

#[derive(Serialize)]
pub struct EntryDisplay {
    pub short_path: String,
    pub target: String,
    pub kind: String,
    pub owner: String,
    pub status: String,
    pub hits: u64,
    pub ttl: u64,
}

impl From<RegistryEntry> for EntryDisplay {
    fn from(entry: RegistryEntry) -> Self {
        Self {
            short_path: entry.short_path,
            target: entry.target,
            kind: entry.kind.to_string(),
            owner: entry.owner_peer_id,
            status: entry.status.to_string(),
            hits: entry.hit_count,
            ttl: entry.cache_ttl,
        }
    }
}

impl TableDisplay for EntryDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Path", "Target", "Kind", "Owner", "Status", "Hits", "TTL"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.short_path.clone(),
            self.target.clone(),
            self.kind.clone(),
            self.owner.clone(),
            self.status.clone(),
            self.hits.to_string(),
            self.ttl.to_string(),
        ]
    }
}

fn parse_kind(kind: &str) -> Result<RegistryKind> {
    kind.parse::<RegistryKind>()
        .map_err(|e| anyhow::anyhow!("{}", e))
}

pub async fn execute(cmd: RegistryCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        RegistryCommands::List => {
            let entries = client.list_registry().await?;
            let displays: Vec<EntryDisplay> =
                entries.into_iter().map(EntryDisplay::from).collect();
            print_list(&displays, format);
        }

        RegistryCommands::Publish {
            short_path,
            target,
            kind,
            ttl,
        } => {
            let entry = client
                .publish(&short_path, &target, parse_kind(&kind)?, ttl)
                .await?;
            print_success(&format!("Published '{}'", entry.short_path));
            print_item(&EntryDisplay::from(entry), format);
        }

        RegistryCommands::Unpublish { short_path } => {
            client.unpublish(&short_path).await?;
            print_success(&format!("Unpublished '{}'", short_path));
        }

        RegistryCommands::Resolve { short_path } => {
            let entry = client.resolve(&short_path).await?;
            print_item(&EntryDisplay::from(entry), format);
        }

        RegistryCommands::Sync => {
            let report = client.registry_sync().await?;
            print_value(&report, format);
        }

        RegistryCommands::Flush => {
            let result = client.flush_cache().await?;
            print_value(&result, format);
        }
    }
    Ok(())
}
