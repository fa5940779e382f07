//! Settings commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::client::ApiClient;
use crate::output::{print_item, print_success, OutputFormat, TableDisplay};
use meshhub_common::Settings;

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Show coordinator settings
    Show,

    /// Update settings fields
    Set {
        /// Share local services and registry entries with the mesh
        #[arg(long)]
        sharing: Option<bool>,

        /// Display name announced to other nodes
        #[arg(long)]
        display_name: Option<String>,

        /// Base domain for the mesh zone
        #[arg(long)]
        base_domain: Option<String>,

        /// Pairing secret peers must present
        #[arg(long)]
        pairing_secret: Option<String>,
    },
}

#[derive(Serialize)]
pub struct SettingsDisplay {
    pub sharing_enabled: bool,
    pub display_name: String,
    pub base_domain: String,
    pub pairing_secret: String,
}

impl From<Settings> for SettingsDisplay {
    fn from(s: Settings) -> Self {
        Self {
            sharing_enabled: s.sharing_enabled,
            display_name: s.display_name.unwrap_or_else(|| "-".to_string()),
            base_domain: s.base_domain,
            pairing_secret: if s.pairing_secret.is_some() {
                "(set)".to_string()
            } else {
                "(unset)".to_string()
            },
        }
    }
}

impl TableDisplay for SettingsDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Sharing", "Display Name", "Base Domain", "Pairing Secret"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.sharing_enabled.to_string(),
            self.display_name.clone(),
            self.base_domain.clone(),
            self.pairing_secret.clone(),
        ]
    }
}

pub async fn execute(cmd: SettingsCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        SettingsCommands::Show => {
            let settings = client.settings().await?;
            print_item(&SettingsDisplay::from(settings), format);
        }

        SettingsCommands::Set {
            sharing,
            display_name,
            base_domain,
            pairing_secret,
        } => {
            let mut settings = client.settings().await?;
            if let Some(sharing) = sharing {
                settings.sharing_enabled = sharing;
            }
            if let Some(name) = display_name {
                settings.display_name = Some(name);
            }
            if let Some(domain) = base_domain {
                settings.base_domain = domain;
            }
            if let Some(secret) = pairing_secret {
                settings.pairing_secret = Some(secret);
            }
            let updated = client.put_settings(&settings).await?;
            print_success("Settings updated");
            print_item(&SettingsDisplay::from(updated), format);
        }
    }
    Ok(())
}
