//! DNS zone commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::client::ApiClient;
use crate::output::{print_list, print_value, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum DnsCommands {
    /// Show the mesh zone
    Zone {
        /// Print the rendered zone file instead of the record table
        #[arg(long)]
        raw: bool,
    },

    /// Rebuild the zone from current mesh state
    Regenerate,

    /// Push and pull zone data with every online peer
    Sync,
}

#[derive(Serialize)]
pub struct RecordDisplay {
    pub name: String,
    pub target: String,
}

impl TableDisplay for RecordDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Target"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.clone(), self.target.clone()]
    }
}

pub async fn execute(cmd: DnsCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        DnsCommands::Zone { raw } => {
            let zone = client.zone().await?;
            if raw {
                println!("{}", zone.content());
                return Ok(());
            }
            println!(
                "Zone {} (serial {}, ttl {})",
                zone.domain, zone.serial, zone.ttl
            );
            let records: Vec<RecordDisplay> = zone
                .records
                .into_iter()
                .map(|r| RecordDisplay {
                    name: r.name,
                    target: r.target,
                })
                .collect();
            print_list(&records, format);
        }

        DnsCommands::Regenerate => {
            let result = client.regenerate_zone().await?;
            print_value(&result, format);
        }

        DnsCommands::Sync => {
            let report = client.zone_sync().await?;
            print_value(&report, format);
        }
    }
    Ok(())
}
