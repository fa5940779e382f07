//! Core types for MeshHub
//!
//! Everything that crosses a boundary lives here: peer records, service
//! records, registry entries, the derived DNS zone, load balancer and backup
//! configuration, and the wire snapshots exchanged between coordinators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Peers
// ============================================================================

/// Peer liveness as decided by the health monitor.
///
/// Transitions are asymmetric by design: reaching `Offline` takes several
/// consecutive missed probes, while a single successful probe from either
/// `Degraded` or `Offline` goes straight back to `Online`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Degraded,
    Offline,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self::Online
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Degraded => write!(f, "degraded"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for PeerStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("unknown peer status: {}", s)),
        }
    }
}

/// A known mesh peer and its last-observed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Stable opaque identifier, unique across the mesh.
    pub id: String,
    pub name: String,
    /// HTTP API address, `host:port`.
    pub address: String,
    pub status: PeerStatus,
    /// Epoch seconds of the last successful contact.
    pub last_seen: i64,
    /// Service-type tags the peer advertises.
    #[serde(default)]
    pub capabilities: Vec<ServiceType>,
    #[serde(default)]
    pub apps_count: u32,
    #[serde(default)]
    pub services_count: u32,
    pub created_at: i64,
}

/// What a node says about itself: the discovery reply and `/mesh/ping` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub capabilities: Vec<ServiceType>,
    #[serde(default)]
    pub apps_count: u32,
    #[serde(default)]
    pub services_count: u32,
    pub version: String,
}

// ============================================================================
// Services
// ============================================================================

/// Enumerated service types a node can host or advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Dns,
    Vpn,
    Firewall,
    Proxy,
    Ids,
    Adblock,
    Captive,
    Monitoring,
    Cache,
    Media,
    Storage,
    Web,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dns => "dns",
            Self::Vpn => "vpn",
            Self::Firewall => "firewall",
            Self::Proxy => "proxy",
            Self::Ids => "ids",
            Self::Adblock => "adblock",
            Self::Captive => "captive",
            Self::Monitoring => "monitoring",
            Self::Cache => "cache",
            Self::Media => "media",
            Self::Storage => "storage",
            Self::Web => "web",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dns" => Ok(Self::Dns),
            "vpn" => Ok(Self::Vpn),
            "firewall" => Ok(Self::Firewall),
            "proxy" => Ok(Self::Proxy),
            "ids" => Ok(Self::Ids),
            "adblock" => Ok(Self::Adblock),
            "captive" => Ok(Self::Captive),
            "monitoring" => Ok(Self::Monitoring),
            "cache" => Ok(Self::Cache),
            "media" => Ok(Self::Media),
            "storage" => Ok(Self::Storage),
            "web" => Ok(Self::Web),
            _ => Err(format!("unknown service type: {}", s)),
        }
    }
}

/// Runtime status of a single service on its owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Online,
    Offline,
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for RuntimeStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("unknown runtime status: {}", s)),
        }
    }
}

/// A named network service owned by one node.
///
/// `(owner_peer_id, name)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub owner_peer_id: String,
    pub port: u16,
    pub runtime_status: RuntimeStatus,
    pub shared: bool,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryKind {
    Proxy,
    Redirect,
    Alias,
    LoadBalanced,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proxy => write!(f, "proxy"),
            Self::Redirect => write!(f, "redirect"),
            Self::Alias => write!(f, "alias"),
            Self::LoadBalanced => write!(f, "load-balanced"),
        }
    }
}

impl std::str::FromStr for RegistryKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy" => Ok(Self::Proxy),
            "redirect" => Ok(Self::Redirect),
            "alias" => Ok(Self::Alias),
            "load-balanced" => Ok(Self::LoadBalanced),
            _ => Err(format!("unknown registry kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Cached,
    Error,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cached => write!(f, "cached"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cached" => Ok(Self::Cached),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown entry status: {}", s)),
        }
    }
}

/// A short path mapped to a network target, cached with a TTL.
///
/// `short_path` is unique mesh-wide. On conflict between two owners, the
/// entry with the earlier `created_at` wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub short_path: String,
    /// `address:port` or a service name for load-balanced entries.
    pub target: String,
    pub kind: RegistryKind,
    pub cache_ttl: u64,
    /// Epoch seconds until which `Resolve` skips revalidation.
    pub cached_until: i64,
    pub hit_count: u64,
    pub status: EntryStatus,
    pub owner_peer_id: String,
    pub created_at: i64,
}

/// Registry state as exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Bumped on every local registry mutation; pullers skip unchanged data.
    pub version: u64,
    pub entries: Vec<RegistryEntry>,
    /// Shared service records advertised alongside the entries.
    pub services: Vec<ServiceRecord>,
}

/// Outcome of one registry sync round across the mesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub peers_contacted: u32,
    pub peers_failed: u32,
    pub added: u32,
    pub updated: u32,
    pub rejected: u32,
}

// ============================================================================
// DNS
// ============================================================================

/// One name-to-target mapping inside a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub name: String,
    pub target: String,
}

/// A DNS zone derived from the registry and peer store.
///
/// Zones are never hand-edited: they are regenerated from current state, and
/// the serial only moves when the rendered content changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsZone {
    pub domain: String,
    pub serial: u32,
    pub ttl: u32,
    pub records: Vec<ZoneRecord>,
}

impl DnsZone {
    /// Deterministic rendering of the zone content, excluding the serial.
    ///
    /// Two zones with the same mappings render byte-identically, which is
    /// what the serial-bump decision compares.
    pub fn content(&self) -> String {
        let mut ordered: BTreeMap<&str, &str> = BTreeMap::new();
        for rec in &self.records {
            ordered.insert(&rec.name, &rec.target);
        }
        let mut out = format!("$ORIGIN {}.\n$TTL {}\n", self.domain, self.ttl);
        for (name, target) in ordered {
            out.push_str(&format!("{}\tIN\tA\t{}\n", name, target));
        }
        out
    }
}

/// Outcome of one zone sync round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneSyncReport {
    pub pushed: u32,
    pub pulled: u32,
    pub failed: u32,
    pub conflicts: u32,
}

/// Zone state as exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    /// Peer id of the coordinator whose zone this is.
    pub origin: String,
    pub serial: u32,
    pub zone: DnsZone,
}

// ============================================================================
// Load balancer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbStrategy {
    RoundRobin,
    LeastConn,
    Weighted,
    Failover,
}

impl Default for LbStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl std::fmt::Display for LbStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round-robin"),
            Self::LeastConn => write!(f, "least-conn"),
            Self::Weighted => write!(f, "weighted"),
            Self::Failover => write!(f, "failover"),
        }
    }
}

impl std::str::FromStr for LbStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "least-conn" => Ok(Self::LeastConn),
            "weighted" => Ok(Self::Weighted),
            "failover" => Ok(Self::Failover),
            _ => Err(format!("unknown load balancer strategy: {}", s)),
        }
    }
}

/// Per-endpoint overrides applied on top of registry-derived endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOverride {
    pub peer_id: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Failover order, lower first.
    #[serde(default)]
    pub priority: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub strategy: LbStrategy,
    pub health_check_enabled: bool,
    pub health_check_interval_seconds: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointOverride>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LbStrategy::RoundRobin,
            health_check_enabled: true,
            health_check_interval_seconds: 30,
            endpoints: Vec::new(),
        }
    }
}

/// A selectable backend for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub peer_id: String,
    pub address: String,
    pub weight: u32,
    pub priority: u32,
    pub active_connections: u32,
    pub healthy: bool,
}

// ============================================================================
// Backup
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupScope {
    Config,
    Apps,
    Data,
    Logs,
}

impl std::fmt::Display for BackupScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Apps => write!(f, "apps"),
            Self::Data => write!(f, "data"),
            Self::Logs => write!(f, "logs"),
        }
    }
}

impl std::str::FromStr for BackupScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(Self::Config),
            "apps" => Ok(Self::Apps),
            "data" => Ok(Self::Data),
            "logs" => Ok(Self::Logs),
            other => Err(format!("unknown backup scope: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    Hourly,
    Daily,
    Weekly,
}

impl std::fmt::Display for ScheduleFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
        }
    }
}

impl std::str::FromStr for ScheduleFrequency {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(format!("unknown schedule frequency: {}", other)),
        }
    }
}

/// Cron-like recurrence: frequency plus time-of-day.
///
/// `at_hour` is ignored for hourly schedules; `at_minute` always applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub frequency: ScheduleFrequency,
    #[serde(default)]
    pub at_hour: u8,
    #[serde(default)]
    pub at_minute: u8,
}

/// A peer configured to receive backups from this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTarget {
    pub peer_id: String,
    pub last_synced_at: Option<i64>,
    /// Flips to false the instant a sync attempt fails, true on success.
    pub synced: bool,
    pub schedule: Option<ScheduleSpec>,
    /// Snapshots kept on the receiving side.
    pub retention: u32,
}

/// Per-target outcome of one backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetReport {
    pub peer_id: String,
    pub ok: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Structured result of a backup run; partial failure is normal here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub started_at: i64,
    pub scopes: Vec<BackupScope>,
    pub targets: Vec<TargetReport>,
}

impl BackupReport {
    pub fn fully_succeeded(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|t| t.ok)
    }

    pub fn fully_failed(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|t| !t.ok)
    }
}

/// A backup archive as stored on the receiving peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArchive {
    pub from_node: String,
    pub scopes: Vec<BackupScope>,
    pub created_at: i64,
    pub payload: serde_json::Value,
}

// ============================================================================
// Broadcast
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Sync,
    Restart,
    Update,
    Backup,
    Custom,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Restart => write!(f, "restart"),
            Self::Update => write!(f, "update"),
            Self::Backup => write!(f, "backup"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// An administrative command fanned out to a peer subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastCommand {
    pub kind: CommandKind,
    /// Free-form argument, only meaningful for `Custom`.
    #[serde(default)]
    pub arg: Option<String>,
}

/// Per-target broadcast outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub ok: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ============================================================================
// Settings & health summary
// ============================================================================

/// Coordinator-level settings, persisted and replicated in config backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub sharing_enabled: bool,
    pub display_name: Option<String>,
    pub base_domain: String,
    /// Shared pairing secret; the only identity mechanism in scope.
    pub pairing_secret: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sharing_enabled: true,
            display_name: None,
            base_domain: "mesh.local".to_string(),
            pairing_secret: None,
        }
    }
}

/// Dashboard-facing health snapshot of this coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub node: NodeAnnouncement,
    pub peers_online: u32,
    pub peers_degraded: u32,
    pub peers_offline: u32,
    pub local_services: u32,
    pub registry_entries: u32,
    pub zone_serial: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_content_is_order_independent() {
        let a = DnsZone {
            domain: "mesh.local".to_string(),
            serial: 1,
            ttl: 300,
            records: vec![
                ZoneRecord { name: "b".into(), target: "10.0.0.2".into() },
                ZoneRecord { name: "a".into(), target: "10.0.0.1".into() },
            ],
        };
        let mut b = a.clone();
        b.records.reverse();
        b.serial = 99;
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn strategy_round_trips_kebab_case() {
        for s in ["round-robin", "least-conn", "weighted", "failover"] {
            let parsed: LbStrategy = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
            let json = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, format!("\"{}\"", s));
        }
    }

    #[test]
    fn service_type_rejects_unknown() {
        assert!("dns".parse::<ServiceType>().is_ok());
        assert!("quantum".parse::<ServiceType>().is_err());
    }

    #[test]
    fn backup_report_classification() {
        let mk = |oks: &[bool]| BackupReport {
            started_at: 0,
            scopes: vec![BackupScope::Config],
            targets: oks
                .iter()
                .enumerate()
                .map(|(i, ok)| TargetReport {
                    peer_id: format!("p{}", i),
                    ok: *ok,
                    error: None,
                    duration_ms: 0,
                })
                .collect(),
        };
        assert!(mk(&[true, true]).fully_succeeded());
        assert!(mk(&[false, false]).fully_failed());
        let partial = mk(&[true, false]);
        assert!(!partial.fully_succeeded());
        assert!(!partial.fully_failed());
    }
}
