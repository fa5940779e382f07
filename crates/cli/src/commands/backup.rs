//! Backup commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;

use crate::client::{ApiClient, BackupTargetView};
use crate::commands::format_epoch;
use crate::output::{print_list, print_success, print_warning, OutputFormat, TableDisplay};
use meshhub_common::{BackupReport, BackupScope, ScheduleFrequency, ScheduleSpec};

#[derive(Subcommand)]
pub enum BackupCommands {
    /// List configured backup targets
    Targets,

    /// Add a peer as a backup target
    AddTarget {
        /// Peer ID
        peer_id: String,

        /// Schedule frequency (hourly, daily, weekly)
        #[arg(long)]
        every: Option<String>,

        /// Hour of day for daily/weekly schedules
        #[arg(long, default_value_t = 3)]
        at_hour: u8,

        /// Minute past the hour
        #[arg(long, default_value_t = 0)]
        at_minute: u8,

        /// Snapshots kept on the receiving side
        #[arg(long, default_value_t = 3)]
        retention: u32,
    },

    /// Remove a backup target
    RemoveTarget {
        /// Peer ID
        peer_id: String,
    },

    /// Run a backup now
    Run {
        /// Scopes to include (config, apps, data, logs)
        #[arg(long, value_delimiter = ',', default_values_t = ["config".to_string(), "data".to_string()])]
        scopes: Vec<String>,

        /// Limit the run to specific target peer IDs
        #[arg(long, value_delimiter = ',')]
        targets: Option<Vec<String>>,
    },

    /// Restore from a peer's copy of this node's backup
    Restore {
        /// Peer to fetch the archive from
        from_peer_id: String,

        /// Confirmation token, as shown by `backup targets`
        #[arg(long)]
        confirm: String,
    },
}

#[derive(Serialize)]
pub struct TargetDisplay {
    pub peer_id: String,
    pub schedule: String,
    pub retention: u32,
    pub synced: String,
    pub last_synced: String,
    pub restore_token: String,
}

impl From<BackupTargetView> for TargetDisplay {
    fn from(view: BackupTargetView) -> Self {
        let t = view.target;
        let schedule = match &t.schedule {
            Some(s) => format!("{} {:02}:{:02}", s.frequency, s.at_hour, s.at_minute),
            None => "manual".to_string(),
        };
        let synced = if t.synced {
            "yes".green().to_string()
        } else {
            "no".red().to_string()
        };
        Self {
            peer_id: t.peer_id,
            schedule,
            retention: t.retention,
            synced,
            last_synced: t.last_synced_at.map(format_epoch).unwrap_or_else(|| "never".to_string()),
            restore_token: view.restore_token,
        }
    }
}

impl TableDisplay for TargetDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Peer", "Schedule", "Retention", "Synced", "Last Synced", "Restore Token"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.peer_id.clone(),
            self.schedule.clone(),
            self.retention.to_string(),
            self.synced.clone(),
            self.last_synced.clone(),
            self.restore_token.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct RunResultDisplay {
    pub peer_id: String,
    pub result: String,
    pub duration_ms: u64,
}

impl TableDisplay for RunResultDisplay {
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

fn parse_scopes(scopes: &[String]) -> Result<Vec<BackupScope>> {
    scopes
        .iter()
        .map(|s| s.parse::<BackupScope>().map_err(|e| anyhow::anyhow!("{}", e)))
        .collect()
}

fn print_report(report: &BackupReport, format: OutputFormat) {
    let displays: Vec<RunResultDisplay> = report
        .targets
        .iter()
        .map(|t| RunResultDisplay {
            peer_id: t.peer_id.clone(),
            result: match &t.error {
                None => "ok".green().to_string(),
                Some(e) => e.red().to_string(),
            },
            duration_ms: t.duration_ms,
        })
        .collect();
    print_list(&displays, format);
    if report.fully_succeeded() {
        print_success("Backup completed on all targets");
    } else if report.fully_failed() {
        print_warning("Backup failed on every target");
    } else {
        print_warning("Backup completed with partial failures");
    }
}

pub async fn execute(cmd: BackupCommands, client: ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        BackupCommands::Targets => {
            let targets = client.backup_targets().await?;
            let displays: Vec<TargetDisplay> =
                targets.into_iter().map(TargetDisplay::from).collect();
            print_list(&displays, format);
        }

        BackupCommands::AddTarget {
            peer_id,
            every,
            at_hour,
            at_minute,
            retention,
        } => {
            let schedule = match every {
                Some(freq) => Some(ScheduleSpec {
                    frequency: freq
                        .parse::<ScheduleFrequency>()
                        .map_err(|e| anyhow::anyhow!("{}", e))?,
                    at_hour,
                    at_minute,
                }),
                None => None,
            };
            let target = client.add_backup_target(&peer_id, schedule, retention).await?;
            print_success(&format!("Backup target '{}' added", target.peer_id));
        }

        BackupCommands::RemoveTarget { peer_id } => {
            client.remove_backup_target(&peer_id).await?;
            print_success(&format!("Backup target '{}' removed", peer_id));
        }

        BackupCommands::Run { scopes, targets } => {
            let report = client.run_backup(parse_scopes(&scopes)?, targets).await?;
            print_report(&report, format);
        }

        BackupCommands::Restore {
            from_peer_id,
            confirm,
        } => {
            let archive = client.restore(&from_peer_id, &confirm).await?;
            print_success(&format!(
                "Restored archive from '{}' (created {})",
                from_peer_id,
                format_epoch(archive.created_at)
            ));
            if format != OutputFormat::Table {
                crate::output::print_value(&archive, format);
            }
        }
    }
    Ok(())
}
