//! DNS zone derivation and federation
//!
//! The zone is never edited directly: it is regenerated from the peer list,
//! the registry, and records learned from peer zones. The serial only moves
//! when the rendered content actually changes, so repeated regeneration from
//! identical state is idempotent. Name collisions resolve to the lexically
//! smaller origin peer id on every node, independent of sync order.

use crate::membership::Membership;
use crate::transport::PeerTransport;
use meshhub_common::{
    Database, DnsZone, PeerStatus, RegistryEntry, Result, ZoneRecord, ZoneSnapshot,
    ZoneSyncReport,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const KV_ZONE_SERIAL: &str = "zone_serial";
const KV_ZONE_HASH: &str = "zone_content_hash";
const KV_LEARNED_RECORDS: &str = "zone_learned_records";

/// A record learned from another coordinator's zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LearnedRecord {
    target: String,
    origin: String,
}

pub struct DnsManager {
    db: Database,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    base_domain: String,
    zone_ttl: u32,
    zone: RwLock<DnsZone>,
}

impl DnsManager {
    pub fn new(
        db: Database,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        base_domain: String,
        zone_ttl: u32,
    ) -> Result<Self> {
        let serial = db
            .kv_get(KV_ZONE_SERIAL)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let zone = DnsZone {
            domain: base_domain.clone(),
            serial,
            ttl: zone_ttl,
            records: Vec::new(),
        };
        Ok(Self {
            db,
            membership,
            transport,
            base_domain,
            zone_ttl,
            zone: RwLock::new(zone),
        })
    }

    pub async fn zone(&self) -> DnsZone {
        self.zone.read().await.clone()
    }

    pub async fn snapshot(&self) -> ZoneSnapshot {
        let zone = self.zone.read().await.clone();
        ZoneSnapshot {
            origin: self.membership.local().id.clone(),
            serial: zone.serial,
            zone,
        }
    }

    /// Rebuild the zone from current state. Returns the zone and whether the
    /// serial was bumped.
    pub async fn regenerate(&self, entries: &[RegistryEntry]) -> Result<(DnsZone, bool)> {
        let mut conflicts = 0u32;
        let mut names: BTreeMap<String, LearnedRecord> = BTreeMap::new();

        // Node name records, this node included.
        let local = self.membership.local();
        insert_record(
            &mut names,
            dns_label(&local.name),
            host_of(&local.address),
            &local.id,
            &mut conflicts,
        );
        for peer in self.membership.list() {
            insert_record(
                &mut names,
                dns_label(&peer.name),
                host_of(&peer.address),
                &peer.id,
                &mut conflicts,
            );
        }

        // Short path records point at their targets.
        for entry in entries {
            insert_record(
                &mut names,
                dns_label(&entry.short_path),
                host_of(&entry.target),
                &entry.owner_peer_id,
                &mut conflicts,
            );
        }

        // Records learned from peer zones lose to anything derived locally
        // from the same name unless their origin sorts first.
        for (name, learned) in self.learned_records()? {
            insert_record(
                &mut names,
                name,
                learned.target,
                &learned.origin,
                &mut conflicts,
            );
        }

        let records: Vec<ZoneRecord> = names
            .into_iter()
            .map(|(name, rec)| ZoneRecord {
                name,
                target: rec.target,
            })
            .collect();

        let mut zone = self.zone.write().await;
        let candidate = DnsZone {
            domain: self.base_domain.clone(),
            serial: zone.serial,
            ttl: self.zone_ttl,
            records,
        };

        let new_hash = content_hash(&candidate);
        let old_hash = self.db.kv_get(KV_ZONE_HASH)?;
        let bumped = old_hash.as_deref() != Some(new_hash.as_str());

        *zone = candidate;
        if bumped {
            zone.serial += 1;
            self.db.kv_set(KV_ZONE_SERIAL, &zone.serial.to_string())?;
            self.db.kv_set(KV_ZONE_HASH, &new_hash)?;
            info!(serial = zone.serial, records = zone.records.len(), conflicts, "zone regenerated");
        } else {
            debug!(serial = zone.serial, "zone unchanged");
        }
        Ok((zone.clone(), bumped))
    }

    /// Merge a peer's zone into our learned record set.
    ///
    /// Every record is attributed to the sending peer; a later push from the
    /// same peer replaces its previous contribution wholesale.
    pub async fn accept_remote(&self, origin_peer_id: &str, snapshot: &ZoneSnapshot) -> Result<u32> {
        let mut learned = self.learned_records()?;
        learned.retain(|_, rec| rec.origin != origin_peer_id);
        let mut accepted = 0u32;
        for rec in &snapshot.zone.records {
            let name = dns_label(&rec.name);
            match learned.get(&name) {
                Some(existing) if existing.origin.as_str() <= origin_peer_id => {
                    warn!(
                        name,
                        kept = %existing.origin,
                        dropped = origin_peer_id,
                        "zone record conflict"
                    );
                }
                _ => {
                    learned.insert(
                        name,
                        LearnedRecord {
                            target: rec.target.clone(),
                            origin: origin_peer_id.to_string(),
                        },
                    );
                    accepted += 1;
                }
            }
        }
        self.db
            .kv_set(KV_LEARNED_RECORDS, &serde_json::to_string(&learned)?)?;
        debug!(origin = origin_peer_id, accepted, "remote zone merged");
        Ok(accepted)
    }

    /// Push our zone to every online peer and pull theirs back.
    pub async fn sync_zones(&self, entries: &[RegistryEntry]) -> Result<ZoneSyncReport> {
        let mut report = ZoneSyncReport::default();
        let snapshot = self.snapshot().await;

        for peer in self.membership.list() {
            if peer.status == PeerStatus::Offline {
                continue;
            }
            match self.transport.push_zone(&peer.address, &snapshot).await {
                Ok(()) => report.pushed += 1,
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "zone push failed");
                    report.failed += 1;
                }
            }
            match self.transport.fetch_zone_snapshot(&peer.address).await {
                Ok(remote) => {
                    self.accept_remote(&remote.origin, &remote).await?;
                    report.pulled += 1;
                }
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "zone pull failed");
                    report.failed += 1;
                }
            }
        }

        self.regenerate(entries).await?;
        info!(
            pushed = report.pushed,
            pulled = report.pulled,
            failed = report.failed,
            "zone sync complete"
        );
        Ok(report)
    }

    fn learned_records(&self) -> Result<BTreeMap<String, LearnedRecord>> {
        Ok(self
            .db
            .kv_get(KV_LEARNED_RECORDS)?
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default())
    }
}

fn insert_record(
    names: &mut BTreeMap<String, LearnedRecord>,
    name: String,
    target: String,
    origin: &str,
    conflicts: &mut u32,
) {
    match names.get(&name) {
        Some(existing) if existing.origin != origin => {
            *conflicts += 1;
            if origin < existing.origin.as_str() {
                warn!(name, kept = origin, dropped = %existing.origin, "zone name conflict");
                names.insert(
                    name,
                    LearnedRecord {
                        target,
                        origin: origin.to_string(),
                    },
                );
            } else {
                warn!(name, kept = %existing.origin, dropped = origin, "zone name conflict");
            }
        }
        Some(_) => {}
        None => {
            names.insert(
                name,
                LearnedRecord {
                    target,
                    origin: origin.to_string(),
                },
            );
        }
    }
}

/// Turn a short path or node name into a single DNS label.
fn dns_label(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Host portion of an `address:port` target.
fn host_of(target: &str) -> String {
    target
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| target.to_string())
}

fn content_hash(zone: &DnsZone) -> String {
    let mut hasher = Sha256::new();
    hasher.update(zone.content().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use meshhub_common::{EntryStatus, NodeAnnouncement, RegistryKind};

    fn local_announcement() -> NodeAnnouncement {
        NodeAnnouncement {
            id: "local".to_string(),
            name: "hub".to_string(),
            address: "10.0.0.1:8787".to_string(),
            capabilities: Vec::new(),
            apps_count: 0,
            services_count: 0,
            version: "test".to_string(),
        }
    }

    fn setup() -> (Arc<MockTransport>, Arc<Membership>, DnsManager) {
        let transport = Arc::new(MockTransport::new());
        let db = Database::open_memory().unwrap();
        let membership = Arc::new(
            Membership::new(db.clone(), transport.clone(), local_announcement()).unwrap(),
        );
        let dns = DnsManager::new(
            db,
            membership.clone(),
            transport.clone(),
            "mesh.local".to_string(),
            300,
        )
        .unwrap();
        (transport, membership, dns)
    }

    fn entry(short_path: &str, target: &str, owner: &str) -> RegistryEntry {
        RegistryEntry {
            short_path: short_path.to_string(),
            target: target.to_string(),
            kind: RegistryKind::Proxy,
            cache_ttl: 300,
            cached_until: 0,
            hit_count: 0,
            status: EntryStatus::Active,
            owner_peer_id: owner.to_string(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn regenerate_is_idempotent() {
        let (_, _, dns) = setup();
        let entries = vec![entry("nas", "10.0.0.5:445", "local")];

        let (zone1, bumped1) = dns.regenerate(&entries).await.unwrap();
        assert!(bumped1);
        assert_eq!(zone1.serial, 1);

        let (zone2, bumped2) = dns.regenerate(&entries).await.unwrap();
        assert!(!bumped2);
        assert_eq!(zone2.serial, 1);
        assert_eq!(zone1.content(), zone2.content());
    }

    #[tokio::test]
    async fn serial_bumps_only_on_content_change() {
        let (_, _, dns) = setup();
        let (zone, _) = dns
            .regenerate(&[entry("nas", "10.0.0.5:445", "local")])
            .await
            .unwrap();
        assert_eq!(zone.serial, 1);

        let (zone, bumped) = dns
            .regenerate(&[entry("nas", "10.0.0.9:445", "local")])
            .await
            .unwrap();
        assert!(bumped);
        assert_eq!(zone.serial, 2);
    }

    #[tokio::test]
    async fn zone_contains_peer_and_entry_records() {
        let (transport, membership, dns) = setup();
        transport.announce_node("10.0.0.2:8787", "p2", "gateway");
        membership.add_peer("10.0.0.2:8787", None).await.unwrap();

        let (zone, _) = dns
            .regenerate(&[entry("media/films", "10.0.0.3:8096", "local")])
            .await
            .unwrap();
        let find = |name: &str| zone.records.iter().find(|r| r.name == name).cloned();
        assert_eq!(find("hub").unwrap().target, "10.0.0.1");
        assert_eq!(find("gateway").unwrap().target, "10.0.0.2");
        assert_eq!(find("media-films").unwrap().target, "10.0.0.3");
    }

    #[tokio::test]
    async fn collision_keeps_lexically_smaller_origin() {
        let (_, _, dns) = setup();
        let entries = vec![
            entry("nas", "10.0.0.5:445", "bbb"),
            entry("nas", "10.0.0.6:445", "aaa"),
        ];
        let (zone, _) = dns.regenerate(&entries).await.unwrap();
        let rec = zone.records.iter().find(|r| r.name == "nas").unwrap();
        assert_eq!(rec.target, "10.0.0.6");

        // Same inputs in the other order converge to the same winner.
        let reversed: Vec<_> = entries.into_iter().rev().collect();
        let (zone2, bumped) = dns.regenerate(&reversed).await.unwrap();
        assert!(!bumped);
        let rec2 = zone2.records.iter().find(|r| r.name == "nas").unwrap();
        assert_eq!(rec2.target, "10.0.0.6");
    }

    #[tokio::test]
    async fn remote_zone_records_survive_regeneration() {
        let (_, _, dns) = setup();
        let remote = ZoneSnapshot {
            origin: "p2".to_string(),
            serial: 7,
            zone: DnsZone {
                domain: "mesh.local".to_string(),
                serial: 7,
                ttl: 300,
                records: vec![ZoneRecord {
                    name: "printer".to_string(),
                    target: "10.0.0.44".to_string(),
                }],
            },
        };
        dns.accept_remote("p2", &remote).await.unwrap();

        let (zone, _) = dns.regenerate(&[]).await.unwrap();
        let rec = zone.records.iter().find(|r| r.name == "printer").unwrap();
        assert_eq!(rec.target, "10.0.0.44");
    }

    #[tokio::test]
    async fn sync_pushes_and_pulls_online_peers_only() {
        let (transport, membership, dns) = setup();
        transport.announce_node("10.0.0.2:8787", "p2", "gateway");
        membership.add_peer("10.0.0.2:8787", None).await.unwrap();
        membership
            .set_status("p2", PeerStatus::Offline)
            .unwrap();

        let report = dns.sync_zones(&[]).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.pulled, 0);
        assert!(transport.pushed_zones.lock().is_empty());

        membership.set_status("p2", PeerStatus::Online).unwrap();
        transport.zone_snapshots.lock().insert(
            "10.0.0.2:8787".to_string(),
            ZoneSnapshot {
                origin: "p2".to_string(),
                serial: 1,
                zone: DnsZone {
                    domain: "mesh.local".to_string(),
                    serial: 1,
                    ttl: 300,
                    records: vec![],
                },
            },
        );
        let report = dns.sync_zones(&[]).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.pulled, 1);
        assert_eq!(transport.pushed_zones.lock().len(), 1);
    }

    #[test]
    fn label_and_host_helpers() {
        assert_eq!(dns_label("Media/Films"), "media-films");
        assert_eq!(dns_label("node one"), "node-one");
        assert_eq!(host_of("10.0.0.5:445"), "10.0.0.5");
        assert_eq!(host_of("10.0.0.5"), "10.0.0.5");
    }
}
