//! Coordinator wiring
//!
//! Builds every subsystem against the shared database and transport, and
//! exposes the handles the HTTP server and background tasks work with.

use crate::backup::BackupCoordinator;
use crate::broadcast::Broadcaster;
use crate::config::MeshConfig;
use crate::dns::DnsManager;
use crate::lb::LoadBalancer;
use crate::membership::Membership;
use crate::registry::Registry;
use crate::transport::PeerTransport;
use meshhub_common::{
    Database, HealthSummary, NodeAnnouncement, PeerStatus, Result, Settings,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const KV_NODE_ID: &str = "node_id";
const KV_SETTINGS: &str = "settings";
const DEFAULT_RECEIVE_RETENTION: u32 = 3;

pub struct Coordinator {
    pub config: MeshConfig,
    pub db: Database,
    pub membership: Arc<Membership>,
    pub registry: Arc<Registry>,
    pub dns: Arc<DnsManager>,
    pub lb: Arc<LoadBalancer>,
    pub backup: Arc<BackupCoordinator>,
    pub broadcaster: Arc<Broadcaster>,
    pub transport: Arc<dyn PeerTransport>,
}

impl Coordinator {
    pub fn new(
        config: MeshConfig,
        db: Database,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        let local = Self::local_announcement(&config, &db)?;
        info!(node = %local.id, name = %local.name, "coordinator identity");

        let membership = Arc::new(Membership::new(db.clone(), transport.clone(), local)?);
        let registry = Arc::new(Registry::new(
            db.clone(),
            membership.clone(),
            transport.clone(),
            config.registry.default_ttl_seconds,
        )?);
        let dns = Arc::new(DnsManager::new(
            db.clone(),
            membership.clone(),
            transport.clone(),
            config.base_domain.clone(),
            config.registry.zone_ttl_seconds,
        )?);
        let lb = Arc::new(LoadBalancer::new(db.clone(), membership.clone())?);
        let backup = Arc::new(BackupCoordinator::new(
            db.clone(),
            membership.clone(),
            transport.clone(),
            Duration::from_secs(config.fanout.backup_timeout_seconds),
            DEFAULT_RECEIVE_RETENTION,
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            membership.clone(),
            transport.clone(),
            Duration::from_secs(config.fanout.broadcast_timeout_seconds),
        ));

        Ok(Self {
            config,
            db,
            membership,
            registry,
            dns,
            lb,
            backup,
            broadcaster,
            transport,
        })
    }

    /// Stable identity for this node: the id is minted once and persisted.
    fn local_announcement(config: &MeshConfig, db: &Database) -> Result<NodeAnnouncement> {
        let id = match db.kv_get(KV_NODE_ID)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                db.kv_set(KV_NODE_ID, &id)?;
                id
            }
        };
        Ok(NodeAnnouncement {
            id,
            name: config.node_name(),
            address: config.advertise_address(),
            capabilities: Vec::new(),
            apps_count: 0,
            services_count: 0,
            version: meshhub_common::VERSION.to_string(),
        })
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(self
            .db
            .kv_get(KV_SETTINGS)?
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default())
    }

    pub fn set_settings(&self, settings: &Settings) -> Result<()> {
        self.db.kv_set(KV_SETTINGS, &serde_json::to_string(settings)?)
    }

    pub async fn health_summary(&self) -> Result<HealthSummary> {
        let peers = self.membership.list();
        let count = |status: PeerStatus| peers.iter().filter(|p| p.status == status).count() as u32;
        let local = self.membership.local();
        let local_services = self
            .db
            .list_services_by_owner(&local.id)?
            .len() as u32;
        Ok(HealthSummary {
            node: local.clone(),
            peers_online: count(PeerStatus::Online),
            peers_degraded: count(PeerStatus::Degraded),
            peers_offline: count(PeerStatus::Offline),
            local_services,
            registry_entries: self.registry.list().await.len() as u32,
            zone_serial: self.dns.zone().await.serial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn node_id_is_stable_across_restarts() {
        let db = Database::open_memory().unwrap();
        let config = MeshConfig::default();
        let first = Coordinator::local_announcement(&config, &db).unwrap();
        let second = Coordinator::local_announcement(&config, &db).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let db = Database::open_memory().unwrap();
        let coordinator = Coordinator::new(
            MeshConfig::default(),
            db,
            Arc::new(MockTransport::new()),
        )
        .unwrap();

        let mut settings = coordinator.settings().unwrap();
        assert!(settings.sharing_enabled);
        settings.sharing_enabled = false;
        settings.display_name = Some("den".to_string());
        coordinator.set_settings(&settings).unwrap();

        let back = coordinator.settings().unwrap();
        assert!(!back.sharing_enabled);
        assert_eq!(back.display_name.as_deref(), Some("den"));
    }
}
