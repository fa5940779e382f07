//! SQLite persistence for MeshHub state
//!
//! Tables:
//! - peers: known mesh peers and their observed status
//! - services: local and learned service records
//! - registry_entries: short path registry, local and mesh-merged
//! - backup_targets: peers configured to receive our backups
//! - backup_archives: backup payloads received from other peers
//! - kv_store: misc singletons (settings, zone state, counters)

use crate::{Error, Result};
use crate::types::{
    BackupArchive, BackupScope, BackupTarget, EntryStatus, Peer, PeerStatus, RegistryEntry,
    RegistryKind, RuntimeStatus, ScheduleSpec, ServiceRecord, ServiceType,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Mesh peers
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'online',
                last_seen INTEGER NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '[]',
                apps_count INTEGER NOT NULL DEFAULT 0,
                services_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_peers_address ON peers(address);

            -- Service records, local and learned
            CREATE TABLE IF NOT EXISTS services (
                owner_peer_id TEXT NOT NULL,
                name TEXT NOT NULL,
                service_type TEXT NOT NULL,
                port INTEGER NOT NULL,
                runtime_status TEXT NOT NULL DEFAULT 'online',
                shared INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (owner_peer_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_services_type ON services(service_type);

            -- Short path registry
            CREATE TABLE IF NOT EXISTS registry_entries (
                short_path TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                kind TEXT NOT NULL,
                cache_ttl INTEGER NOT NULL,
                cached_until INTEGER NOT NULL DEFAULT 0,
                hit_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                owner_peer_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_registry_owner ON registry_entries(owner_peer_id);

            -- Backup targets
            CREATE TABLE IF NOT EXISTS backup_targets (
                peer_id TEXT PRIMARY KEY,
                last_synced_at INTEGER,
                synced INTEGER NOT NULL DEFAULT 0,
                schedule TEXT,
                retention INTEGER NOT NULL DEFAULT 3
            );

            -- Backup archives received from other nodes
            CREATE TABLE IF NOT EXISTS backup_archives (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_node TEXT NOT NULL,
                scopes TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_archives_from ON backup_archives(from_node, created_at);

            -- Key-value store for misc state
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Peer operations
    // ========================================================================

    pub fn upsert_peer(&self, peer: &Peer) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (id, name, address, status, last_seen, capabilities, apps_count, services_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                address = excluded.address,
                status = excluded.status,
                last_seen = excluded.last_seen,
                capabilities = excluded.capabilities,
                apps_count = excluded.apps_count,
                services_count = excluded.services_count",
            params![
                peer.id,
                peer.name,
                peer.address,
                peer.status.to_string(),
                peer.last_seen,
                serde_json::to_string(&peer.capabilities)?,
                peer.apps_count,
                peer.services_count,
                peer.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_peer(&self, id: &str) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, address, status, last_seen, capabilities, apps_count, services_count, created_at
             FROM peers WHERE id = ?1",
            params![id],
            row_to_peer,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_peer_by_address(&self, address: &str) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, address, status, last_seen, capabilities, apps_count, services_count, created_at
             FROM peers WHERE address = ?1",
            params![address],
            row_to_peer,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, address, status, last_seen, capabilities, apps_count, services_count, created_at
             FROM peers ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_peer)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    pub fn delete_peer(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM peers WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn update_peer_status(&self, id: &str, status: PeerStatus, last_seen: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE peers SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status.to_string(), last_seen, id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Service operations
    // ========================================================================

    pub fn upsert_service(&self, svc: &ServiceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO services (owner_peer_id, name, service_type, port, runtime_status, shared)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(owner_peer_id, name) DO UPDATE SET
                service_type = excluded.service_type,
                port = excluded.port,
                runtime_status = excluded.runtime_status,
                shared = excluded.shared",
            params![
                svc.owner_peer_id,
                svc.name,
                svc.service_type.to_string(),
                svc.port,
                svc.runtime_status.to_string(),
                svc.shared as i64,
            ],
        )?;
        Ok(())
    }

    pub fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT owner_peer_id, name, service_type, port, runtime_status, shared
             FROM services ORDER BY owner_peer_id, name",
        )?;
        let rows = stmt.query_map([], row_to_service)?;
        let mut services = Vec::new();
        for row in rows {
            services.push(row?);
        }
        Ok(services)
    }

    pub fn list_services_by_owner(&self, owner: &str) -> Result<Vec<ServiceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT owner_peer_id, name, service_type, port, runtime_status, shared
             FROM services WHERE owner_peer_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![owner], row_to_service)?;
        let mut services = Vec::new();
        for row in rows {
            services.push(row?);
        }
        Ok(services)
    }

    pub fn delete_services_by_owner(&self, owner: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM services WHERE owner_peer_id = ?1",
            params![owner],
        )?;
        Ok(n)
    }

    // ========================================================================
    // Registry operations
    // ========================================================================

    pub fn upsert_registry_entry(&self, entry: &RegistryEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO registry_entries
                (short_path, target, kind, cache_ttl, cached_until, hit_count, status, owner_peer_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(short_path) DO UPDATE SET
                target = excluded.target,
                kind = excluded.kind,
                cache_ttl = excluded.cache_ttl,
                cached_until = excluded.cached_until,
                hit_count = excluded.hit_count,
                status = excluded.status,
                owner_peer_id = excluded.owner_peer_id,
                created_at = excluded.created_at",
            params![
                entry.short_path,
                entry.target,
                entry.kind.to_string(),
                entry.cache_ttl,
                entry.cached_until,
                entry.hit_count,
                entry.status.to_string(),
                entry.owner_peer_id,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_registry_entry(&self, short_path: &str) -> Result<Option<RegistryEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT short_path, target, kind, cache_ttl, cached_until, hit_count, status, owner_peer_id, created_at
             FROM registry_entries WHERE short_path = ?1",
            params![short_path],
            row_to_entry,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_registry_entries(&self) -> Result<Vec<RegistryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT short_path, target, kind, cache_ttl, cached_until, hit_count, status, owner_peer_id, created_at
             FROM registry_entries ORDER BY short_path",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn delete_registry_entry(&self, short_path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM registry_entries WHERE short_path = ?1",
            params![short_path],
        )?;
        Ok(n > 0)
    }

    pub fn delete_registry_entries_by_owner(&self, owner: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM registry_entries WHERE owner_peer_id = ?1",
            params![owner],
        )?;
        Ok(n)
    }

    // ========================================================================
    // Backup target operations
    // ========================================================================

    pub fn upsert_backup_target(&self, target: &BackupTarget) -> Result<()> {
        let conn = self.conn.lock();
        let schedule = match &target.schedule {
            Some(s) => Some(serde_json::to_string(s)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO backup_targets (peer_id, last_synced_at, synced, schedule, retention)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(peer_id) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                synced = excluded.synced,
                schedule = excluded.schedule,
                retention = excluded.retention",
            params![
                target.peer_id,
                target.last_synced_at,
                target.synced as i64,
                schedule,
                target.retention,
            ],
        )?;
        Ok(())
    }

    pub fn get_backup_target(&self, peer_id: &str) -> Result<Option<BackupTarget>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT peer_id, last_synced_at, synced, schedule, retention
             FROM backup_targets WHERE peer_id = ?1",
            params![peer_id],
            row_to_target,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_backup_targets(&self) -> Result<Vec<BackupTarget>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT peer_id, last_synced_at, synced, schedule, retention
             FROM backup_targets ORDER BY peer_id",
        )?;
        let rows = stmt.query_map([], row_to_target)?;
        let mut targets = Vec::new();
        for row in rows {
            targets.push(row?);
        }
        Ok(targets)
    }

    pub fn delete_backup_target(&self, peer_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM backup_targets WHERE peer_id = ?1",
            params![peer_id],
        )?;
        Ok(n > 0)
    }

    // ========================================================================
    // Backup archive operations
    // ========================================================================

    pub fn insert_backup_archive(&self, archive: &BackupArchive) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backup_archives (from_node, scopes, created_at, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                archive.from_node,
                serde_json::to_string(&archive.scopes)?,
                archive.created_at,
                serde_json::to_string(&archive.payload)?,
            ],
        )?;
        Ok(())
    }

    /// Latest archive received from the given node, if any.
    pub fn latest_backup_archive(&self, from_node: &str) -> Result<Option<BackupArchive>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT from_node, scopes, created_at, payload
             FROM backup_archives WHERE from_node = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![from_node],
            row_to_archive,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Keep only the `retention` newest archives per sender.
    pub fn prune_backup_archives(&self, from_node: &str, retention: u32) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM backup_archives WHERE from_node = ?1 AND id NOT IN (
                SELECT id FROM backup_archives WHERE from_node = ?1
                ORDER BY created_at DESC, id DESC LIMIT ?2
            )",
            params![from_node, retention],
        )?;
        Ok(n)
    }

    // ========================================================================
    // Key-value operations
    // ========================================================================

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }
}

// ============================================================================
// Row mappers
// ============================================================================

fn parse_text<T: std::str::FromStr>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse::<T>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad value: {}", s).into(),
        )
    })
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Peer> {
    let status: String = row.get(3)?;
    let caps: String = row.get(5)?;
    let capabilities: Vec<ServiceType> = serde_json::from_str(&caps).unwrap_or_default();
    Ok(Peer {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        status: parse_text::<PeerStatus>(3, &status)?,
        last_seen: row.get(4)?,
        capabilities,
        apps_count: row.get(6)?,
        services_count: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceRecord> {
    let st: String = row.get(2)?;
    let rs: String = row.get(4)?;
    Ok(ServiceRecord {
        owner_peer_id: row.get(0)?,
        name: row.get(1)?,
        service_type: parse_text::<ServiceType>(2, &st)?,
        port: row.get(3)?,
        runtime_status: parse_text::<RuntimeStatus>(4, &rs)?,
        shared: row.get::<_, i64>(5)? != 0,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistryEntry> {
    let kind: String = row.get(2)?;
    let status: String = row.get(6)?;
    Ok(RegistryEntry {
        short_path: row.get(0)?,
        target: row.get(1)?,
        kind: parse_text::<RegistryKind>(2, &kind)?,
        cache_ttl: row.get(3)?,
        cached_until: row.get(4)?,
        hit_count: row.get(5)?,
        status: parse_text::<EntryStatus>(6, &status)?,
        owner_peer_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupTarget> {
    let schedule: Option<String> = row.get(3)?;
    let schedule: Option<ScheduleSpec> =
        schedule.and_then(|s| serde_json::from_str(&s).ok());
    Ok(BackupTarget {
        peer_id: row.get(0)?,
        last_synced_at: row.get(1)?,
        synced: row.get::<_, i64>(2)? != 0,
        schedule,
        retention: row.get(4)?,
    })
}

fn row_to_archive(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupArchive> {
    let scopes: String = row.get(1)?;
    let payload: String = row.get(3)?;
    let scopes: Vec<BackupScope> = serde_json::from_str(&scopes).unwrap_or_default();
    let payload = serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
    Ok(BackupArchive {
        from_node: row.get(0)?,
        scopes,
        created_at: row.get(2)?,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScheduleFrequency, ScheduleSpec};

    fn sample_peer(id: &str, address: &str) -> Peer {
        Peer {
            id: id.to_string(),
            name: format!("node-{}", id),
            address: address.to_string(),
            status: PeerStatus::Online,
            last_seen: 100,
            capabilities: vec![ServiceType::Dns, ServiceType::Vpn],
            apps_count: 2,
            services_count: 3,
            created_at: 50,
        }
    }

    #[test]
    fn peer_round_trip() {
        let db = Database::open_memory().unwrap();
        let peer = sample_peer("p1", "10.0.0.1:8787");
        db.upsert_peer(&peer).unwrap();

        let got = db.get_peer("p1").unwrap().unwrap();
        assert_eq!(got.address, "10.0.0.1:8787");
        assert_eq!(got.capabilities, vec![ServiceType::Dns, ServiceType::Vpn]);

        db.update_peer_status("p1", PeerStatus::Offline, 200).unwrap();
        let got = db.get_peer("p1").unwrap().unwrap();
        assert_eq!(got.status, PeerStatus::Offline);
        assert_eq!(got.last_seen, 200);

        assert!(db.delete_peer("p1").unwrap());
        assert!(db.get_peer("p1").unwrap().is_none());
        assert!(!db.delete_peer("p1").unwrap());
    }

    #[test]
    fn peer_address_is_unique() {
        let db = Database::open_memory().unwrap();
        db.upsert_peer(&sample_peer("p1", "10.0.0.1:8787")).unwrap();
        let dup = sample_peer("p2", "10.0.0.1:8787");
        assert!(db.upsert_peer(&dup).is_err());
    }

    #[test]
    fn registry_entry_round_trip() {
        let db = Database::open_memory().unwrap();
        let entry = RegistryEntry {
            short_path: "nas".to_string(),
            target: "10.0.0.5:445".to_string(),
            kind: RegistryKind::Proxy,
            cache_ttl: 300,
            cached_until: 1000,
            hit_count: 7,
            status: EntryStatus::Active,
            owner_peer_id: "p1".to_string(),
            created_at: 10,
        };
        db.upsert_registry_entry(&entry).unwrap();
        let got = db.get_registry_entry("nas").unwrap().unwrap();
        assert_eq!(got.kind, RegistryKind::Proxy);
        assert_eq!(got.hit_count, 7);

        assert_eq!(db.list_registry_entries().unwrap().len(), 1);
        assert_eq!(db.delete_registry_entries_by_owner("p1").unwrap(), 1);
        assert!(db.get_registry_entry("nas").unwrap().is_none());
    }

    #[test]
    fn backup_target_schedule_round_trip() {
        let db = Database::open_memory().unwrap();
        let target = BackupTarget {
            peer_id: "p1".to_string(),
            last_synced_at: None,
            synced: false,
            schedule: Some(ScheduleSpec {
                frequency: ScheduleFrequency::Daily,
                at_hour: 3,
                at_minute: 30,
            }),
            retention: 5,
        };
        db.upsert_backup_target(&target).unwrap();
        let got = db.get_backup_target("p1").unwrap().unwrap();
        let sched = got.schedule.unwrap();
        assert_eq!(sched.frequency, ScheduleFrequency::Daily);
        assert_eq!(sched.at_hour, 3);
        assert_eq!(got.retention, 5);
    }

    #[test]
    fn archive_retention_keeps_newest() {
        let db = Database::open_memory().unwrap();
        for i in 0..5 {
            db.insert_backup_archive(&BackupArchive {
                from_node: "p1".to_string(),
                scopes: vec![BackupScope::Config],
                created_at: i,
                payload: serde_json::json!({"n": i}),
            })
            .unwrap();
        }
        let pruned = db.prune_backup_archives("p1", 2).unwrap();
        assert_eq!(pruned, 3);
        let latest = db.latest_backup_archive("p1").unwrap().unwrap();
        assert_eq!(latest.created_at, 4);
    }

    #[test]
    fn kv_set_overwrites() {
        let db = Database::open_memory().unwrap();
        db.kv_set("zone_serial", "1").unwrap();
        db.kv_set("zone_serial", "2").unwrap();
        assert_eq!(db.kv_get("zone_serial").unwrap().unwrap(), "2");
        assert!(db.kv_get("missing").unwrap().is_none());
    }
}
