//! Service commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::client::ApiClient;
use crate::output::{print_item, print_list, print_success, OutputFormat, TableDisplay};
use meshhub_common::ServiceRecord;

#[derive(Subcommand)]
pub enum ServiceCommands {
    /// List services (local and learned)
    List {
        /// Only services shared by other nodes
        #[arg(long)]
        mesh: bool,
    },

    /// Register a local service
    Register {
        /// Service name
        name: String,

        /// Service type (dns, vpn, proxy, media, storage, ...)
        #[arg(short = 't', long = "type")]
        service_type: String,

        /// Listening port
        #[arg(short, long)]
        port: u16,

        /// Share the service into the mesh
        #[arg(long)]
        shared: bool,
    },
}

#[derive(Serialize)]
pub struct ServiceDisplay {
    pub name: String,
    pub service_type: String,
    pub owner: String,
    pub port: u16,
    pub status: String,
    pub shared: bool,
}

impl From<ServiceRecord> for ServiceDisplay {
    fn from(svc: ServiceRecord) -> Self {
        Self {
            name: svc.name,
            service_type: svc.service_type.to_string(),
            owner: svc.owner_peer_id,
            port: svc.port,
            status: svc.runtime_status.to_string(),
            shared: svc.shared,
        }
    }
}

impl TableDisplay for ServiceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Type", "Owner", "Port", "Status", "Shared"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.service_type.clone(),
            self.owner.clone(),
            self.port.to_string(),
            self.status.clone(),
            self.shared.to_string(),
        ]
    }
}

pub async fn execute(cmd: ServiceCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ServiceCommands::List { mesh } => {
            let services = client.list_services(mesh).await?;
            let displays: Vec<ServiceDisplay> =
                services.into_iter().map(ServiceDisplay::from).collect();
            print_list(&displays, format);
        }

        ServiceCommands::Register {
            name,
            service_type,
            port,
            shared,
        } => {
            let svc = client
                .register_service(&name, &service_type, port, shared)
                .await?;
            print_success(&format!("Service '{}' registered", svc.name));
            print_item(&ServiceDisplay::from(svc), format);
        }
    }
    Ok(())
}
