//! CLI command modules

pub mod backup;
pub mod broadcast;
pub mod dns;
pub mod lb;
pub mod peer;
pub mod registry;
pub mod service;
pub mod settings;

/// Render an epoch-seconds timestamp for tables.
pub fn format_epoch(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
