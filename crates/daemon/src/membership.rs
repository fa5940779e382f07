//! Peer membership store
//!
//! Holds the authoritative peer list (SQLite-backed, cached in a DashMap),
//! validates joins with a live probe, and owns the per-peer cancellation
//! tokens that in-flight fan-out operations watch. Removal cascades to the
//! peer's services, registry entries and backup target.

use crate::transport::PeerTransport;
use dashmap::DashMap;
use meshhub_common::{
    now_epoch_secs, Database, Error, NodeAnnouncement, Peer, PeerStatus, Result,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Membership change notifications
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    PeerAdded(Peer),
    PeerRemoved(String),
    StatusChanged { id: String, status: PeerStatus },
}

pub struct Membership {
    db: Database,
    transport: Arc<dyn PeerTransport>,
    local: NodeAnnouncement,
    peers: DashMap<String, Peer>,
    tokens: DashMap<String, CancellationToken>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Membership {
    pub fn new(
        db: Database,
        transport: Arc<dyn PeerTransport>,
        local: NodeAnnouncement,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(64);
        let membership = Self {
            db,
            transport,
            local,
            peers: DashMap::new(),
            tokens: DashMap::new(),
            events,
        };
        for peer in membership.db.list_peers()? {
            membership
                .tokens
                .insert(peer.id.clone(), CancellationToken::new());
            membership.peers.insert(peer.id.clone(), peer);
        }
        Ok(membership)
    }

    pub fn local(&self) -> &NodeAnnouncement {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn get_by_address(&self, address: &str) -> Option<Peer> {
        self.peers
            .iter()
            .find(|p| p.value().address == address)
            .map(|p| p.value().clone())
    }

    /// Cancellation token for in-flight operations against this peer.
    /// `None` means the peer is not (or no longer) a member.
    pub fn cancellation(&self, id: &str) -> Option<CancellationToken> {
        self.tokens.get(id).map(|t| t.value().clone())
    }

    /// Add a peer after a successful validation probe.
    ///
    /// The probe's self-announcement supplies the peer id and default name;
    /// an explicit `name` overrides the announced one.
    pub async fn add_peer(&self, address: &str, name: Option<String>) -> Result<Peer> {
        if address == self.local.address {
            return Err(Error::InvalidConfig(
                "cannot add this node as its own peer".to_string(),
            ));
        }
        if self.get_by_address(address).is_some() {
            return Err(Error::DuplicatePeer {
                address: address.to_string(),
            });
        }

        let ann = self.transport.ping(address).await?;
        if ann.id == self.local.id {
            return Err(Error::InvalidConfig(
                "address resolves to this node".to_string(),
            ));
        }
        if self.peers.contains_key(&ann.id) {
            return Err(Error::DuplicatePeer {
                address: address.to_string(),
            });
        }

        let now = now_epoch_secs();
        let peer = Peer {
            id: ann.id.clone(),
            name: name.unwrap_or(ann.name),
            address: address.to_string(),
            status: PeerStatus::Online,
            last_seen: now,
            capabilities: ann.capabilities,
            apps_count: ann.apps_count,
            services_count: ann.services_count,
            created_at: now,
        };

        self.db.upsert_peer(&peer)?;
        self.tokens
            .insert(peer.id.clone(), CancellationToken::new());
        self.peers.insert(peer.id.clone(), peer.clone());
        info!(peer = %peer.id, address, "peer added");
        let _ = self.events.send(MembershipEvent::PeerAdded(peer.clone()));
        Ok(peer)
    }

    /// Merge a discovery round into the peer store.
    ///
    /// A reply proves the sender is alive, so unknown announcers are inserted
    /// as online peers without a separate validation probe; known peers get
    /// their `last_seen` and announced metadata refreshed. Returns the peers
    /// seen in this round.
    pub fn merge_discovered(&self, announcements: &[NodeAnnouncement]) -> Result<Vec<Peer>> {
        let mut seen = Vec::new();
        for ann in announcements {
            if ann.id == self.local.id {
                continue;
            }
            if self.peers.contains_key(&ann.id) {
                self.record_announcement(&ann.id, ann)?;
                self.set_status(&ann.id, PeerStatus::Online)?;
                if let Some(peer) = self.get(&ann.id) {
                    seen.push(peer);
                }
                continue;
            }
            let now = now_epoch_secs();
            let peer = Peer {
                id: ann.id.clone(),
                name: ann.name.clone(),
                address: ann.address.clone(),
                status: PeerStatus::Online,
                last_seen: now,
                capabilities: ann.capabilities.clone(),
                apps_count: ann.apps_count,
                services_count: ann.services_count,
                created_at: now,
            };
            self.db.upsert_peer(&peer)?;
            self.tokens
                .insert(peer.id.clone(), CancellationToken::new());
            self.peers.insert(peer.id.clone(), peer.clone());
            info!(peer = %peer.id, address = %peer.address, "peer discovered");
            let _ = self.events.send(MembershipEvent::PeerAdded(peer.clone()));
            seen.push(peer);
        }
        Ok(seen)
    }

    /// Remove a peer and everything derived from it.
    ///
    /// Cancels the peer's token first so concurrent fan-out operations abort
    /// with `PeerRemoved` instead of reporting stale results.
    pub fn remove_peer(&self, id: &str) -> Result<()> {
        let (_, peer) = self
            .peers
            .remove(id)
            .ok_or_else(|| Error::not_found("peer", id))?;
        if let Some((_, token)) = self.tokens.remove(id) {
            token.cancel();
        }

        self.db.delete_peer(id)?;
        self.db.delete_services_by_owner(id)?;
        self.db.delete_registry_entries_by_owner(id)?;
        self.db.delete_backup_target(id)?;

        info!(peer = %id, address = %peer.address, "peer removed");
        let _ = self.events.send(MembershipEvent::PeerRemoved(id.to_string()));
        Ok(())
    }

    /// Record a probe outcome. Returns the new status.
    pub fn set_status(&self, id: &str, status: PeerStatus) -> Result<PeerStatus> {
        let mut entry = self
            .peers
            .get_mut(id)
            .ok_or(Error::PeerRemoved { id: id.to_string() })?;
        let now = now_epoch_secs();
        if status == PeerStatus::Online {
            entry.last_seen = now;
        }
        if entry.status != status {
            warn!(peer = %id, from = %entry.status, to = %status, "peer status changed");
            entry.status = status;
            self.db.update_peer_status(id, status, entry.last_seen)?;
            let _ = self.events.send(MembershipEvent::StatusChanged {
                id: id.to_string(),
                status,
            });
        } else {
            self.db.update_peer_status(id, status, entry.last_seen)?;
        }
        Ok(status)
    }

    /// Refresh announced metadata after a successful probe.
    pub fn record_announcement(&self, id: &str, ann: &NodeAnnouncement) -> Result<()> {
        let mut entry = self
            .peers
            .get_mut(id)
            .ok_or(Error::PeerRemoved { id: id.to_string() })?;
        entry.capabilities = ann.capabilities.clone();
        entry.apps_count = ann.apps_count;
        entry.services_count = ann.services_count;
        entry.last_seen = now_epoch_secs();
        let peer = entry.value().clone();
        drop(entry);
        self.db.upsert_peer(&peer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn local_announcement() -> NodeAnnouncement {
        NodeAnnouncement {
            id: "local".to_string(),
            name: "local-node".to_string(),
            address: "10.0.0.1:8787".to_string(),
            capabilities: Vec::new(),
            apps_count: 0,
            services_count: 0,
            version: "test".to_string(),
        }
    }

    fn setup() -> (Arc<MockTransport>, Membership) {
        let transport = Arc::new(MockTransport::new());
        let db = Database::open_memory().unwrap();
        let membership =
            Membership::new(db, transport.clone(), local_announcement()).unwrap();
        (transport, membership)
    }

    #[tokio::test]
    async fn add_peer_probes_and_persists() {
        let (transport, membership) = setup();
        transport.announce_node("10.0.0.2:8787", "p2", "node-two");

        let peer = membership.add_peer("10.0.0.2:8787", None).await.unwrap();
        assert_eq!(peer.id, "p2");
        assert_eq!(peer.name, "node-two");
        assert_eq!(peer.status, PeerStatus::Online);
        assert_eq!(membership.list().len(), 1);
        assert!(membership.cancellation("p2").is_some());
    }

    #[tokio::test]
    async fn duplicate_address_is_rejected() {
        let (transport, membership) = setup();
        transport.announce_node("10.0.0.2:8787", "p2", "node-two");

        membership.add_peer("10.0.0.2:8787", None).await.unwrap();
        let err = membership
            .add_peer("10.0.0.2:8787", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePeer { .. }));
    }

    #[tokio::test]
    async fn unreachable_address_is_rejected() {
        let (transport, membership) = setup();
        transport.set_unreachable("10.0.0.9:8787", true);

        let err = membership
            .add_peer("10.0.0.9:8787", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { .. }));
        assert!(membership.list().is_empty());
    }

    #[tokio::test]
    async fn cannot_add_self() {
        let (transport, membership) = setup();
        transport.announce_node("10.0.0.7:8787", "local", "me-again");

        assert!(membership.add_peer("10.0.0.1:8787", None).await.is_err());
        // Different address, same announced id
        assert!(membership.add_peer("10.0.0.7:8787", None).await.is_err());
    }

    #[tokio::test]
    async fn remove_cancels_token_and_cascades() {
        let (transport, membership) = setup();
        transport.announce_node("10.0.0.2:8787", "p2", "node-two");
        membership.add_peer("10.0.0.2:8787", None).await.unwrap();

        let token = membership.cancellation("p2").unwrap();
        assert!(!token.is_cancelled());

        membership.remove_peer("p2").unwrap();
        assert!(token.is_cancelled());
        assert!(membership.get("p2").is_none());
        assert!(matches!(
            membership.remove_peer("p2").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn discovery_round_merges_into_store() {
        let (_, membership) = setup();
        let ann = NodeAnnouncement {
            id: "p9".to_string(),
            name: "found-node".to_string(),
            address: "10.0.0.9:8787".to_string(),
            capabilities: Vec::new(),
            apps_count: 0,
            services_count: 2,
            version: "test".to_string(),
        };

        let seen = membership
            .merge_discovered(&[ann.clone(), local_announcement()])
            .unwrap();
        assert_eq!(seen.len(), 1);
        let peer = membership.get("p9").unwrap();
        assert_eq!(peer.status, PeerStatus::Online);
        assert_eq!(peer.address, "10.0.0.9:8787");
        assert!(membership.cancellation("p9").is_some());

        // A later round refreshes the same peer instead of duplicating it,
        // and brings it back online if probes had marked it down.
        membership.set_status("p9", PeerStatus::Offline).unwrap();
        let seen = membership.merge_discovered(&[ann]).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(membership.list().len(), 1);
        assert_eq!(membership.get("p9").unwrap().status, PeerStatus::Online);
    }

    #[tokio::test]
    async fn status_change_emits_event() {
        let (transport, membership) = setup();
        transport.announce_node("10.0.0.2:8787", "p2", "node-two");
        membership.add_peer("10.0.0.2:8787", None).await.unwrap();

        let mut events = membership.subscribe();
        membership.set_status("p2", PeerStatus::Degraded).unwrap();
        match events.try_recv().unwrap() {
            MembershipEvent::StatusChanged { id, status } => {
                assert_eq!(id, "p2");
                assert_eq!(status, PeerStatus::Degraded);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
