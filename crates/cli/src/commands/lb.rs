//! Load balancer commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::client::ApiClient;
use crate::output::{print_item, print_list, print_success, OutputFormat, TableDisplay};
use meshhub_common::{Endpoint, LbStrategy};

#[derive(Subcommand)]
pub enum LbCommands {
    /// Show a service's balancing config
    Config {
        /// Service name
        service: String,
    },

    /// Set the balancing strategy for a service
    SetStrategy {
        /// Service name
        service: String,

        /// Strategy (round-robin, least-conn, weighted, failover)
        strategy: String,
    },

    /// List candidate endpoints with live state
    Endpoints {
        /// Service name
        service: String,
    },

    /// Pick an endpoint once (dry run of the selection logic)
    Acquire {
        /// Service name
        service: String,
    },
}

#[derive(Serialize)]
pub struct EndpointDisplay {
    pub peer_id: String,
    pub address: String,
    pub weight: u32,
    pub priority: u32,
    pub connections: u32,
    pub healthy: bool,
}

impl From<Endpoint> for EndpointDisplay {
    fn from(ep: Endpoint) -> Self {
        Self {
            peer_id: ep.peer_id,
            address: ep.address,
            weight: ep.weight,
            priority: ep.priority,
            connections: ep.active_connections,
            healthy: ep.healthy,
        }
    }
}

impl TableDisplay for EndpointDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Peer", "Address", "Weight", "Priority", "Conns", "Healthy"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.peer_id.clone(),
            self.address.clone(),
            self.weight.to_string(),
            self.priority.to_string(),
            self.connections.to_string(),
            self.healthy.to_string(),
        ]
    }
}

pub async fn execute(cmd: LbCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        LbCommands::Config { service } => {
            let config = client.lb_config(&service).await?;
            crate::output::print_value(&config, format);
        }

        LbCommands::SetStrategy { service, strategy } => {
            let strategy: LbStrategy = strategy
                .parse()
                .map_err(|e: String| anyhow::anyhow!("{}", e))?;
            let mut config = client.lb_config(&service).await?;
            config.strategy = strategy;
            client.set_lb_config(&service, &config).await?;
            print_success(&format!("Strategy for '{}' set to {}", service, strategy));
        }

        LbCommands::Endpoints { service } => {
            let endpoints = client.lb_endpoints(&service).await?;
            let displays: Vec<EndpointDisplay> =
                endpoints.into_iter().map(EndpointDisplay::from).collect();
            print_list(&displays, format);
        }

        LbCommands::Acquire { service } => {
            let endpoint = client.lb_acquire(&service).await?;
            print_item(&EndpointDisplay::from(endpoint), format);
        }
    }
    Ok(())
}
