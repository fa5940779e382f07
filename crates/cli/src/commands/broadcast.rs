//! Broadcast commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;

use crate::client::ApiClient;
use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum BroadcastCommands {
    /// Ask peers to pull registry and zone updates
    Sync {
        /// Limit to specific peer IDs
        #[arg(long, value_delimiter = ',')]
        peers: Option<Vec<String>>,
    },

    /// Ask peers to restart their coordinator
    Restart {
        #[arg(long, value_delimiter = ',')]
        peers: Option<Vec<String>>,
    },

    /// Ask peers to check for updates
    Update {
        #[arg(long, value_delimiter = ',')]
        peers: Option<Vec<String>>,
    },

    /// Ask peers to run a backup
    Backup {
        #[arg(long, value_delimiter = ',')]
        peers: Option<Vec<String>>,
    },

    /// Send an arbitrary command string
    Custom {
        /// Command to run on each peer
        command: String,

        #[arg(long, value_delimiter = ',')]
        peers: Option<Vec<String>>,
    },
}

#[derive(Serialize)]
pub struct OutcomeDisplay {
    pub peer_id: String,
    pub result: String,
    pub duration_ms: u64,
}

impl TableDisplay for OutcomeDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Peer", "Result", "Duration (ms)"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.peer_id.clone(),
            self.result.clone(),
            self.duration_ms.to_string(),
        ]
    }
}

pub async fn execute(cmd: BroadcastCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    let (kind, arg, peers) = match cmd {
        BroadcastCommands::Sync { peers } => ("sync", None, peers),
        BroadcastCommands::Restart { peers } => ("restart", None, peers),
        BroadcastCommands::Update { peers } => ("update", None, peers),
        BroadcastCommands::Backup { peers } => ("backup", None, peers),
        BroadcastCommands::Custom { command, peers } => ("custom", Some(command), peers),
    };

    let outcomes = client.broadcast(kind, arg, peers).await?;
    let mut displays: Vec<OutcomeDisplay> = outcomes
        .into_iter()
        .map(|(peer_id, outcome)| OutcomeDisplay {
            peer_id,
            result: match &outcome.error {
                None => "ok".green().to_string(),
                Some(e) => e.red().to_string(),
            },
            duration_ms: outcome.duration_ms,
        })
        .collect();
    displays.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    print_list(&displays, format);
    Ok(())
}
