//! Service registry and short path cache
//!
//! Local entries are authoritative for this node; entries learned from peers
//! are merged in with a deterministic conflict rule so every node converges
//! on the same winner regardless of sync order: earliest `created_at` wins,
//! ties broken by the lexically smaller owner id. Hit counts merge as the
//! maximum of both sides, never a sum.

use crate::membership::Membership;
use crate::transport::PeerTransport;
use meshhub_common::{
    now_epoch_secs, Database, EntryStatus, Error, PeerStatus, RegistryEntry, RegistryKind,
    RegistrySnapshot, Result, ServiceRecord, SyncReport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const KV_REGISTRY_VERSION: &str = "registry_version";

pub struct Registry {
    db: Database,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    entries: RwLock<HashMap<String, RegistryEntry>>,
    version: AtomicU64,
    default_ttl: u64,
}

impl Registry {
    pub fn new(
        db: Database,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        default_ttl: u64,
    ) -> Result<Self> {
        let mut entries = HashMap::new();
        for entry in db.list_registry_entries()? {
            entries.insert(entry.short_path.clone(), entry);
        }
        let version = db
            .kv_get(KV_REGISTRY_VERSION)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Self {
            db,
            membership,
            transport,
            entries: RwLock::new(entries),
            version: AtomicU64::new(version),
            default_ttl,
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump_version(&self) -> Result<u64> {
        let v = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.db.kv_set(KV_REGISTRY_VERSION, &v.to_string())?;
        Ok(v)
    }

    // ========================================================================
    // Publish / unpublish
    // ========================================================================

    /// Publish a short path owned by this node.
    ///
    /// Republishing an existing local entry is idempotent: the target and
    /// TTL are updated while `created_at` and `hit_count` are preserved, so
    /// a republish never loses a conflict it previously won.
    pub async fn publish(
        &self,
        short_path: &str,
        target: &str,
        kind: RegistryKind,
        cache_ttl: Option<u64>,
    ) -> Result<RegistryEntry> {
        let short_path = normalize_short_path(short_path)?;
        let local_id = self.membership.local().id.clone();
        let now = now_epoch_secs();
        let ttl = cache_ttl.unwrap_or(self.default_ttl);

        let mut entries = self.entries.write().await;
        let entry = match entries.get(&short_path) {
            Some(existing) if existing.owner_peer_id != local_id => {
                return Err(Error::PathConflict {
                    short_path,
                    owner: existing.owner_peer_id.clone(),
                });
            }
            Some(existing) => RegistryEntry {
                short_path: short_path.clone(),
                target: target.to_string(),
                kind,
                cache_ttl: ttl,
                cached_until: now + ttl as i64,
                hit_count: existing.hit_count,
                status: EntryStatus::Active,
                owner_peer_id: local_id,
                created_at: existing.created_at,
            },
            None => RegistryEntry {
                short_path: short_path.clone(),
                target: target.to_string(),
                kind,
                cache_ttl: ttl,
                cached_until: now + ttl as i64,
                hit_count: 0,
                status: EntryStatus::Active,
                owner_peer_id: local_id,
                created_at: now,
            },
        };

        self.db.upsert_registry_entry(&entry)?;
        entries.insert(short_path.clone(), entry.clone());
        drop(entries);
        self.bump_version()?;
        info!(short_path, target, "registry entry published");
        Ok(entry)
    }

    /// Remove a locally owned short path.
    pub async fn unpublish(&self, short_path: &str) -> Result<()> {
        let short_path = normalize_short_path(short_path)?;
        let local_id = &self.membership.local().id;

        let mut entries = self.entries.write().await;
        match entries.get(&short_path) {
            None => return Err(Error::not_found("registry entry", short_path)),
            Some(entry) if &entry.owner_peer_id != local_id => {
                return Err(Error::PathConflict {
                    short_path,
                    owner: entry.owner_peer_id.clone(),
                });
            }
            Some(_) => {}
        }
        entries.remove(&short_path);
        drop(entries);
        self.db.delete_registry_entry(&short_path)?;
        self.bump_version()?;
        info!(short_path, "registry entry unpublished");
        Ok(())
    }

    // ========================================================================
    // Resolve
    // ========================================================================

    /// Resolve a short path, counting the hit and revalidating expired
    /// cache state against the owner's health.
    pub async fn resolve(&self, short_path: &str) -> Result<RegistryEntry> {
        let short_path = normalize_short_path(short_path)?;
        let now = now_epoch_secs();
        let local_id = &self.membership.local().id;

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&short_path)
            .ok_or_else(|| Error::not_found("registry entry", short_path.clone()))?;

        entry.hit_count += 1;

        if entry.cached_until < now {
            let owner_status = if &entry.owner_peer_id == local_id {
                Some(PeerStatus::Online)
            } else {
                self.membership.get(&entry.owner_peer_id).map(|p| p.status)
            };
            match owner_status {
                Some(PeerStatus::Online) => {
                    entry.cached_until = now + entry.cache_ttl as i64;
                    entry.status = EntryStatus::Active;
                }
                Some(PeerStatus::Degraded) => {
                    // Serve stale until the owner recovers or goes offline.
                    entry.status = EntryStatus::Cached;
                }
                Some(PeerStatus::Offline) | None => {
                    entry.status = EntryStatus::Error;
                }
            }
        }

        let resolved = entry.clone();
        self.db.upsert_registry_entry(&resolved)?;
        debug!(short_path, hits = resolved.hit_count, status = %resolved.status, "resolved");
        Ok(resolved)
    }

    pub async fn list(&self) -> Vec<RegistryEntry> {
        let entries = self.entries.read().await;
        let mut list: Vec<RegistryEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| a.short_path.cmp(&b.short_path));
        list
    }

    pub async fn get(&self, short_path: &str) -> Option<RegistryEntry> {
        let short_path = normalize_short_path(short_path).ok()?;
        self.entries.read().await.get(&short_path).cloned()
    }

    /// Expire every cached entry so the next resolve revalidates.
    pub async fn flush_cache(&self) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        for entry in entries.values_mut() {
            entry.cached_until = 0;
            entry.status = EntryStatus::Cached;
            self.db.upsert_registry_entry(entry)?;
        }
        info!(count, "registry cache flushed");
        Ok(count)
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub async fn upsert_service(&self, svc: &ServiceRecord) -> Result<()> {
        self.db.upsert_service(svc)?;
        if svc.owner_peer_id == self.membership.local().id {
            self.bump_version()?;
        }
        Ok(())
    }

    pub fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.db.list_services()
    }

    /// Services shared into the mesh by other nodes.
    pub fn list_mesh_services(&self) -> Result<Vec<ServiceRecord>> {
        let local_id = &self.membership.local().id;
        Ok(self
            .db
            .list_services()?
            .into_iter()
            .filter(|s| s.shared && &s.owner_peer_id != local_id)
            .collect())
    }

    // ========================================================================
    // Mesh sync
    // ========================================================================

    /// Snapshot served to peers: all entries plus locally shared services.
    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        let local_id = &self.membership.local().id;
        let services = self
            .db
            .list_services()?
            .into_iter()
            .filter(|s| s.shared && &s.owner_peer_id == local_id)
            .collect();
        Ok(RegistrySnapshot {
            version: self.version(),
            entries: self.list().await,
            services,
        })
    }

    /// Pull snapshots from every online peer and merge them in.
    pub async fn sync_with_peers(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for peer in self.membership.list() {
            if peer.status == PeerStatus::Offline {
                continue;
            }
            report.peers_contacted += 1;
            match self.transport.fetch_registry_snapshot(&peer.address).await {
                Ok(snapshot) => {
                    let (added, updated, rejected) = self.merge_snapshot(snapshot).await?;
                    report.added += added;
                    report.updated += updated;
                    report.rejected += rejected;
                }
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "registry sync failed");
                    report.peers_failed += 1;
                }
            }
        }
        info!(
            contacted = report.peers_contacted,
            failed = report.peers_failed,
            added = report.added,
            updated = report.updated,
            rejected = report.rejected,
            "registry sync complete"
        );
        Ok(report)
    }

    /// Merge one remote snapshot. Returns (added, updated, rejected).
    pub async fn merge_snapshot(&self, snapshot: RegistrySnapshot) -> Result<(u32, u32, u32)> {
        let (mut added, mut updated, mut rejected) = (0u32, 0u32, 0u32);
        let mut changed = false;

        let mut entries = self.entries.write().await;
        for remote in snapshot.entries {
            let Ok(short_path) = normalize_short_path(&remote.short_path) else {
                rejected += 1;
                continue;
            };
            match entries.get_mut(&short_path) {
                None => {
                    debug!(short_path, owner = %remote.owner_peer_id, "learned entry");
                    self.db.upsert_registry_entry(&remote)?;
                    entries.insert(short_path, remote);
                    added += 1;
                    changed = true;
                }
                Some(local) if local.owner_peer_id == remote.owner_peer_id => {
                    let hits = local.hit_count.max(remote.hit_count);
                    let grew = hits != local.hit_count;
                    if remote.created_at <= local.created_at
                        && (grew
                            || remote.target != local.target
                            || remote.cache_ttl != local.cache_ttl)
                    {
                        local.target = remote.target;
                        local.cache_ttl = remote.cache_ttl;
                        local.hit_count = hits;
                        self.db.upsert_registry_entry(local)?;
                        updated += 1;
                        changed = true;
                    }
                }
                Some(local) => {
                    if entry_wins(&remote, local) {
                        warn!(
                            short_path,
                            loser = %local.owner_peer_id,
                            winner = %remote.owner_peer_id,
                            "registry conflict, earlier entry wins"
                        );
                        let hits = local.hit_count.max(remote.hit_count);
                        *local = remote;
                        local.hit_count = hits;
                        self.db.upsert_registry_entry(local)?;
                        updated += 1;
                        changed = true;
                    } else {
                        rejected += 1;
                    }
                }
            }
        }
        drop(entries);

        for svc in snapshot.services {
            if svc.shared && svc.owner_peer_id != self.membership.local().id {
                self.db.upsert_service(&svc)?;
            }
        }

        if changed {
            self.bump_version()?;
        }
        Ok((added, updated, rejected))
    }
}

/// Deterministic conflict rule: earliest creation wins, lexically smaller
/// owner id breaks ties.
fn entry_wins(candidate: &RegistryEntry, incumbent: &RegistryEntry) -> bool {
    (candidate.created_at, &candidate.owner_peer_id)
        < (incumbent.created_at, &incumbent.owner_peer_id)
}

/// Lowercase, strip surrounding slashes, restrict the alphabet.
fn normalize_short_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_matches('/').to_lowercase();
    if trimmed.is_empty() {
        return Err(Error::InvalidConfig("short path is empty".to_string()));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/')
    {
        return Err(Error::InvalidConfig(format!(
            "short path '{}' contains invalid characters",
            trimmed
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use meshhub_common::NodeAnnouncement;

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

    fn setup() -> (Arc<MockTransport>, Arc<Membership>, Registry) {
        let transport = Arc::new(MockTransport::new());
        let db = Database::open_memory().unwrap();
        let membership = Arc::new(
            Membership::new(db.clone(), transport.clone(), local_announcement()).unwrap(),
        );
        let registry =
            Registry::new(db, membership.clone(), transport.clone(), 300).unwrap();
        (transport, membership, registry)
    }

    fn remote_entry(short_path: &str, owner: &str, created_at: i64) -> RegistryEntry {
        RegistryEntry {
            short_path: short_path.to_string(),
            target: format!("{}-target:80", owner),
            kind: RegistryKind::Proxy,
            cache_ttl: 300,
            cached_until: 0,
            hit_count: 0,
            status: EntryStatus::Active,
            owner_peer_id: owner.to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn republish_is_idempotent_and_keeps_hits() {
        let (_, _, registry) = setup();
        registry
            .publish("nas", "10.0.0.5:445", RegistryKind::Proxy, None)
            .await
            .unwrap();
        registry.resolve("nas").await.unwrap();
        registry.resolve("nas").await.unwrap();

        let again = registry
            .publish("nas", "10.0.0.6:445", RegistryKind::Proxy, Some(60))
            .await
            .unwrap();
        assert_eq!(again.hit_count, 2);
        assert_eq!(again.target, "10.0.0.6:445");
        assert_eq!(again.cache_ttl, 60);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn publish_over_foreign_entry_conflicts() {
        let (_, _, registry) = setup();
        let foreign = remote_entry("nas", "aaa", 1);
        registry
            .merge_snapshot(RegistrySnapshot {
                version: 1,
                entries: vec![foreign],
                services: vec![],
            })
            .await
            .unwrap();

        let err = registry
            .publish("nas", "10.0.0.5:445", RegistryKind::Proxy, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathConflict { .. }));
    }

    #[tokio::test]
    async fn merge_earliest_created_wins() {
        let (_, _, registry) = setup();
        registry
            .publish("nas", "local:445", RegistryKind::Proxy, None)
            .await
            .unwrap();

        // Older remote entry takes the path over.
        let (_, updated, _) = registry
            .merge_snapshot(RegistrySnapshot {
                version: 1,
                entries: vec![remote_entry("nas", "aaa", 1)],
                services: vec![],
            })
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let entry = registry.get("nas").await.unwrap();
        assert_eq!(entry.owner_peer_id, "aaa");

        // Newer remote entry is rejected.
        let (_, _, rejected) = registry
            .merge_snapshot(RegistrySnapshot {
                version: 2,
                entries: vec![remote_entry("nas", "zzz", 999_999_999_999)],
                services: vec![],
            })
            .await
            .unwrap();
        assert_eq!(rejected, 1);
        assert_eq!(registry.get("nas").await.unwrap().owner_peer_id, "aaa");
    }

    #[tokio::test]
    async fn merge_tie_breaks_on_owner_id() {
        let (_, _, registry) = setup();
        registry
            .merge_snapshot(RegistrySnapshot {
                version: 1,
                entries: vec![remote_entry("nas", "bbb", 10)],
                services: vec![],
            })
            .await
            .unwrap();
        registry
            .merge_snapshot(RegistrySnapshot {
                version: 1,
                entries: vec![remote_entry("nas", "aaa", 10)],
                services: vec![],
            })
            .await
            .unwrap();
        assert_eq!(registry.get("nas").await.unwrap().owner_peer_id, "aaa");
    }

    #[tokio::test]
    async fn merge_hit_count_is_max_not_sum() {
        let (_, _, registry) = setup();
        registry
            .publish("nas", "local:445", RegistryKind::Proxy, None)
            .await
            .unwrap();
        for _ in 0..5 {
            registry.resolve("nas").await.unwrap();
        }

        let mut remote = remote_entry("nas", "local", 0);
        remote.created_at = registry.get("nas").await.unwrap().created_at;
        remote.target = "local:445".to_string();
        remote.hit_count = 3;
        registry
            .merge_snapshot(RegistrySnapshot {
                version: 1,
                entries: vec![remote],
                services: vec![],
            })
            .await
            .unwrap();
        assert_eq!(registry.get("nas").await.unwrap().hit_count, 5);
    }

    #[tokio::test]
    async fn version_is_monotonic_across_mutations() {
        let (_, _, registry) = setup();
        let v0 = registry.version();
        registry
            .publish("a", "t:1", RegistryKind::Alias, None)
            .await
            .unwrap();
        let v1 = registry.version();
        registry
            .publish("b", "t:2", RegistryKind::Alias, None)
            .await
            .unwrap();
        let v2 = registry.version();
        registry.unpublish("a").await.unwrap();
        let v3 = registry.version();
        assert!(v0 < v1 && v1 < v2 && v2 < v3);
    }

    #[tokio::test]
    async fn resolve_counts_hits_and_unknown_fails() {
        let (_, _, registry) = setup();
        registry
            .publish("nas", "t:1", RegistryKind::Proxy, None)
            .await
            .unwrap();
        assert_eq!(registry.resolve("nas").await.unwrap().hit_count, 1);
        assert_eq!(registry.resolve("/NAS/").await.unwrap().hit_count, 2);
        assert!(matches!(
            registry.resolve("missing").await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn expired_entry_of_offline_owner_turns_error() {
        let (transport, membership, registry) = setup();
        transport.announce_node("10.0.0.2:8787", "p2", "node-two");
        membership.add_peer("10.0.0.2:8787", None).await.unwrap();

        let mut entry = remote_entry("cam", "p2", 1);
        entry.cached_until = 0; // already expired
        registry
            .merge_snapshot(RegistrySnapshot {
                version: 1,
                entries: vec![entry],
                services: vec![],
            })
            .await
            .unwrap();

        membership.set_status("p2", PeerStatus::Offline).unwrap();
        let resolved = registry.resolve("cam").await.unwrap();
        assert_eq!(resolved.status, EntryStatus::Error);

        membership.set_status("p2", PeerStatus::Online).unwrap();
        let resolved = registry.resolve("cam").await.unwrap();
        assert_eq!(resolved.status, EntryStatus::Active);
        assert!(resolved.cached_until > 0);
    }

    #[tokio::test]
    async fn flush_cache_forces_revalidation() {
        let (_, _, registry) = setup();
        registry
            .publish("nas", "t:1", RegistryKind::Proxy, None)
            .await
            .unwrap();
        registry.flush_cache().await.unwrap();
        let entry = registry.get("nas").await.unwrap();
        assert_eq!(entry.cached_until, 0);
        // Local owner is always online, so resolve reactivates.
        let resolved = registry.resolve("nas").await.unwrap();
        assert_eq!(resolved.status, EntryStatus::Active);
    }

    #[test]
    fn short_path_normalization() {
        assert_eq!(normalize_short_path("/NAS/").unwrap(), "nas");
        assert_eq!(normalize_short_path("media/films").unwrap(), "media/films");
        assert!(normalize_short_path("   ").is_err());
        assert!(normalize_short_path("bad path").is_err());
    }
}
