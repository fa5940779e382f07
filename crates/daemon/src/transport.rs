//! Peer transport interface and HTTP implementation
//!
//! All coordinator-to-coordinator traffic goes through `PeerTransport`, so
//! every subsystem that talks to peers can be driven by a scripted mock in
//! tests without opening sockets.

use async_trait::async_trait;
use meshhub_common::{
    BackupArchive, BroadcastCommand, Error, NodeAnnouncement, RegistrySnapshot, Result,
    ZoneSnapshot,
};
use std::time::Duration;
use tracing::debug;

/// Coordinator-to-coordinator operations
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Probe a peer and fetch its self-announcement
    async fn ping(&self, address: &str) -> Result<NodeAnnouncement>;

    /// Fetch the peer's registry snapshot
    async fn fetch_registry_snapshot(&self, address: &str) -> Result<RegistrySnapshot>;

    /// Fetch the peer's zone snapshot
    async fn fetch_zone_snapshot(&self, address: &str) -> Result<ZoneSnapshot>;

    /// Push our zone snapshot to a peer
    async fn push_zone(&self, address: &str, zone: &ZoneSnapshot) -> Result<()>;

    /// Push a backup archive to a peer
    async fn push_backup(&self, address: &str, archive: &BackupArchive) -> Result<()>;

    /// Fetch the latest archive the peer holds for the given node
    async fn fetch_backup(&self, address: &str, node_id: &str) -> Result<BackupArchive>;

    /// Deliver an administrative command to a peer
    async fn send_command(&self, address: &str, command: &BroadcastCommand) -> Result<()>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// HTTP/JSON transport against the `/mesh/*` peer protocol
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client init failed: {}", e)))?;
        Ok(Self { client })
    }

    fn url(address: &str, path: &str) -> String {
        format!("http://{}{}", address, path)
    }

    fn unreachable(address: &str, err: reqwest::Error) -> Error {
        Error::PeerUnreachable {
            address: address.to_string(),
            reason: err.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        address: &str,
        path: &str,
    ) -> Result<T> {
        let resp = self
            .client
            .get(Self::url(address, path))
            .send()
            .await
            .map_err(|e| Self::unreachable(address, e))?;
        if !resp.status().is_success() {
            return Err(Error::PeerUnreachable {
                address: address.to_string(),
                reason: format!("HTTP {} on {}", resp.status(), path),
            });
        }
        resp.json().await.map_err(|e| Self::unreachable(address, e))
    }

    async fn post_json<B: serde::Serialize>(
        &self,
        address: &str,
        path: &str,
        body: &B,
    ) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(address, path))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::unreachable(address, e))?;
        if !resp.status().is_success() {
            return Err(Error::PeerUnreachable {
                address: address.to_string(),
                reason: format!("HTTP {} on {}", resp.status(), path),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn ping(&self, address: &str) -> Result<NodeAnnouncement> {
        debug!(address, "pinging peer");
        self.get_json(address, "/mesh/ping").await
    }

    async fn fetch_registry_snapshot(&self, address: &str) -> Result<RegistrySnapshot> {
        self.get_json(address, "/mesh/registry-snapshot").await
    }

    async fn fetch_zone_snapshot(&self, address: &str) -> Result<ZoneSnapshot> {
        self.get_json(address, "/mesh/zone-snapshot").await
    }

    async fn push_zone(&self, address: &str, zone: &ZoneSnapshot) -> Result<()> {
        self.post_json(address, "/mesh/zone", zone).await
    }

    async fn push_backup(&self, address: &str, archive: &BackupArchive) -> Result<()> {
        self.post_json(address, "/mesh/backup", archive).await
    }

    async fn fetch_backup(&self, address: &str, node_id: &str) -> Result<BackupArchive> {
        self.get_json(address, &format!("/mesh/backup/{}", node_id))
            .await
    }

    async fn send_command(&self, address: &str, command: &BroadcastCommand) -> Result<()> {
        self.post_json(address, "/mesh/command", command).await
    }
}

// ============================================================================
// Scripted mock for tests
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// Scripted transport: per-address responses, recorded outbound traffic.
    #[derive(Default)]
    pub struct MockTransport {
        pub announcements: Mutex<HashMap<String, NodeAnnouncement>>,
        pub registry_snapshots: Mutex<HashMap<String, RegistrySnapshot>>,
        pub zone_snapshots: Mutex<HashMap<String, ZoneSnapshot>>,
        pub served_backups: Mutex<HashMap<String, BackupArchive>>,
        pub unreachable: Mutex<HashSet<String>>,
        pub delays_ms: Mutex<HashMap<String, u64>>,
        pub pushed_zones: Mutex<Vec<(String, ZoneSnapshot)>>,
        pub pushed_backups: Mutex<Vec<(String, BackupArchive)>>,
        pub commands: Mutex<Vec<(String, BroadcastCommand)>>,
        pub ping_counts: Mutex<HashMap<String, u32>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn announce(&self, address: &str, ann: NodeAnnouncement) {
            self.announcements
                .lock()
                .insert(address.to_string(), ann);
        }

        pub fn announce_node(&self, address: &str, id: &str, name: &str) {
            self.announce(
                address,
                NodeAnnouncement {
                    id: id.to_string(),
                    name: name.to_string(),
                    address: address.to_string(),
                    capabilities: Vec::new(),
                    apps_count: 0,
                    services_count: 0,
                    version: "test".to_string(),
                },
            );
        }

        pub fn set_unreachable(&self, address: &str, down: bool) {
            if down {
                self.unreachable.lock().insert(address.to_string());
            } else {
                self.unreachable.lock().remove(address);
            }
        }

        pub fn set_delay(&self, address: &str, ms: u64) {
            self.delays_ms.lock().insert(address.to_string(), ms);
        }

        async fn check(&self, address: &str) -> Result<()> {
            let delay = self.delays_ms.lock().get(address).copied();
            if let Some(ms) = delay {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if self.unreachable.lock().contains(address) {
                return Err(Error::PeerUnreachable {
                    address: address.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn ping(&self, address: &str) -> Result<NodeAnnouncement> {
            *self
                .ping_counts
                .lock()
                .entry(address.to_string())
                .or_insert(0) += 1;
            self.check(address).await?;
            self.announcements
                .lock()
                .get(address)
                .cloned()
                .ok_or_else(|| Error::PeerUnreachable {
                    address: address.to_string(),
                    reason: "no announcement scripted".to_string(),
                })
        }

        async fn fetch_registry_snapshot(&self, address: &str) -> Result<RegistrySnapshot> {
            self.check(address).await?;
            self.registry_snapshots
                .lock()
                .get(address)
                .cloned()
                .ok_or_else(|| Error::PeerUnreachable {
                    address: address.to_string(),
                    reason: "no snapshot scripted".to_string(),
                })
        }

        async fn fetch_zone_snapshot(&self, address: &str) -> Result<ZoneSnapshot> {
            self.check(address).await?;
            self.zone_snapshots
                .lock()
                .get(address)
                .cloned()
                .ok_or_else(|| Error::PeerUnreachable {
                    address: address.to_string(),
                    reason: "no zone scripted".to_string(),
                })
        }

        async fn push_zone(&self, address: &str, zone: &ZoneSnapshot) -> Result<()> {
            self.check(address).await?;
            self.pushed_zones
                .lock()
                .push((address.to_string(), zone.clone()));
            Ok(())
        }

        async fn push_backup(&self, address: &str, archive: &BackupArchive) -> Result<()> {
            self.check(address).await?;
            self.pushed_backups
                .lock()
                .push((address.to_string(), archive.clone()));
            Ok(())
        }

        async fn fetch_backup(&self, address: &str, _node_id: &str) -> Result<BackupArchive> {
            self.check(address).await?;
            self.served_backups
                .lock()
                .get(address)
                .cloned()
                .ok_or_else(|| Error::PeerUnreachable {
                    address: address.to_string(),
                    reason: "no backup scripted".to_string(),
                })
        }

        async fn send_command(&self, address: &str, command: &BroadcastCommand) -> Result<()> {
            self.check(address).await?;
            self.commands
                .lock()
                .push((address.to_string(), command.clone()));
            Ok(())
        }
    }
}
