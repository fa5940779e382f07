//! Multi-point backup coordination
//!
//! Backups fan out to every configured target concurrently, each push bounded
//! by a timeout and aborted early if the peer is removed mid-flight. Partial
//! failure is a normal outcome and is reported per target, never collapsed
//! into a single error.

use crate::membership::Membership;
use crate::transport::PeerTransport;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use futures::future::join_all;
use meshhub_common::{
    now_epoch_secs, BackupArchive, BackupReport, BackupScope, BackupTarget, Database, Error,
    Result, ScheduleFrequency, ScheduleSpec, Settings, TargetReport,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const KV_SETTINGS: &str = "settings";
const SCHEDULER_TICK: Duration = Duration::from_secs(30);

pub struct BackupCoordinator {
    db: Database,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    push_timeout: Duration,
    /// Archives kept per sending node on the receiving side.
    receive_retention: u32,
}

impl BackupCoordinator {
    pub fn new(
        db: Database,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        push_timeout: Duration,
        receive_retention: u32,
    ) -> Self {
        Self {
            db,
            membership,
            transport,
            push_timeout,
            receive_retention,
        }
    }

    // ========================================================================
    // Targets
    // ========================================================================

    pub fn add_target(
        &self,
        peer_id: &str,
        schedule: Option<ScheduleSpec>,
        retention: u32,
    ) -> Result<BackupTarget> {
        if self.membership.get(peer_id).is_none() {
            return Err(Error::not_found("peer", peer_id));
        }
        let target = BackupTarget {
            peer_id: peer_id.to_string(),
            last_synced_at: None,
            synced: false,
            schedule,
            retention,
        };
        self.db.upsert_backup_target(&target)?;
        info!(peer = peer_id, "backup target added");
        Ok(target)
    }

    pub fn remove_target(&self, peer_id: &str) -> Result<()> {
        if !self.db.delete_backup_target(peer_id)? {
            return Err(Error::not_found("backup target", peer_id));
        }
        info!(peer = peer_id, "backup target removed");
        Ok(())
    }

    pub fn list_targets(&self) -> Result<Vec<BackupTarget>> {
        self.db.list_backup_targets()
    }

    /// Token a caller must echo back to confirm a restore from this peer.
    pub fn restore_token(peer_id: &str) -> String {
        format!("restore-{}", peer_id)
    }

    // ========================================================================
    // Backup run
    // ========================================================================

    /// Push an archive with the given scopes to the named targets, or to
    /// every configured target when `only` is `None`. Requested ids that are
    /// not configured backup targets are rejected before any push.
    pub async fn run_backup(
        &self,
        scopes: Vec<BackupScope>,
        only: Option<Vec<String>>,
    ) -> Result<BackupReport> {
        let mut targets = self.db.list_backup_targets()?;
        if let Some(ids) = only {
            for id in &ids {
                if !targets.iter().any(|t| &t.peer_id == id) {
                    return Err(Error::not_found("backup target", id));
                }
            }
            targets.retain(|t| ids.contains(&t.peer_id));
        }
        let started_at = now_epoch_secs();
        let archive = BackupArchive {
            from_node: self.membership.local().id.clone(),
            scopes: scopes.clone(),
            created_at: started_at,
            payload: self.collect_payload(&scopes)?,
        };

        let pushes = targets.iter().map(|target| {
            let archive = &archive;
            let peer_id = target.peer_id.clone();
            async move {
                let start = Instant::now();
                let outcome = self.push_to_target(&peer_id, archive).await;
                (peer_id, outcome, start.elapsed())
            }
        });

        let mut report = BackupReport {
            started_at,
            scopes,
            targets: Vec::new(),
        };
        for (peer_id, outcome, elapsed) in join_all(pushes).await {
            let ok = outcome.is_ok();
            let error = outcome.err().map(|e| e.to_string());
            if let Some(err) = &error {
                warn!(peer = %peer_id, error = err, "backup push failed");
            }
            if let Some(mut target) = self.db.get_backup_target(&peer_id)? {
                target.synced = ok;
                if ok {
                    target.last_synced_at = Some(now_epoch_secs());
                }
                self.db.upsert_backup_target(&target)?;
            }
            report.targets.push(TargetReport {
                peer_id,
                ok,
                error,
                duration_ms: elapsed.as_millis() as u64,
            });
        }
        info!(
            targets = report.targets.len(),
            failed = report.targets.iter().filter(|t| !t.ok).count(),
            "backup run complete"
        );
        Ok(report)
    }

    async fn push_to_target(&self, peer_id: &str, archive: &BackupArchive) -> Result<()> {
        let peer = self
            .membership
            .get(peer_id)
            .ok_or(Error::PeerRemoved {
                id: peer_id.to_string(),
            })?;
        let token = self
            .membership
            .cancellation(peer_id)
            .ok_or(Error::PeerRemoved {
                id: peer_id.to_string(),
            })?;

        tokio::select! {
            _ = token.cancelled() => Err(Error::PeerRemoved { id: peer_id.to_string() }),
            pushed = tokio::time::timeout(
                self.push_timeout,
                self.transport.push_backup(&peer.address, archive),
            ) => match pushed {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { seconds: self.push_timeout.as_secs() }),
            },
        }
    }

    /// Assemble the archive payload for the requested scopes.
    fn collect_payload(&self, scopes: &[BackupScope]) -> Result<serde_json::Value> {
        let mut payload = serde_json::Map::new();
        for scope in scopes {
            let value = match scope {
                BackupScope::Config => {
                    let settings: Settings = self
                        .db
                        .kv_get(KV_SETTINGS)?
                        .and_then(|v| serde_json::from_str(&v).ok())
                        .unwrap_or_default();
                    serde_json::json!({
                        "settings": settings,
                        "backup_targets": self.db.list_backup_targets()?,
                    })
                }
                BackupScope::Data => serde_json::json!({
                    "registry_entries": self.db.list_registry_entries()?,
                    "services": self.db.list_services()?,
                }),
                BackupScope::Apps => serde_json::json!({
                    "services": self.db.list_services()?,
                }),
                BackupScope::Logs => serde_json::json!({
                    "exported_at": now_epoch_secs(),
                }),
            };
            payload.insert(scope.to_string(), value);
        }
        Ok(serde_json::Value::Object(payload))
    }

    // ========================================================================
    // Receiving side
    // ========================================================================

    /// Store an archive pushed by a peer and prune to the retention window.
    pub fn receive(&self, archive: &BackupArchive) -> Result<()> {
        self.db.insert_backup_archive(archive)?;
        let pruned = self
            .db
            .prune_backup_archives(&archive.from_node, self.receive_retention)?;
        debug!(from = %archive.from_node, pruned, "backup archive stored");
        Ok(())
    }

    pub fn serve(&self, node_id: &str) -> Result<BackupArchive> {
        self.db
            .latest_backup_archive(node_id)?
            .ok_or(Error::NoBackupAvailable {
                peer_id: node_id.to_string(),
            })
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Fetch our latest archive back from a peer and apply it locally.
    ///
    /// Destroys local state, so the caller must echo the restore token for
    /// the source peer. Checked before any network traffic.
    pub async fn restore(&self, from_peer_id: &str, confirm: &str) -> Result<BackupArchive> {
        if confirm != Self::restore_token(from_peer_id) {
            return Err(Error::RestoreNotConfirmed(format!(
                "expected token for peer {}",
                from_peer_id
            )));
        }
        let peer = self
            .membership
            .get(from_peer_id)
            .ok_or_else(|| Error::not_found("peer", from_peer_id))?;

        let local_id = &self.membership.local().id;
        let archive = self
            .transport
            .fetch_backup(&peer.address, local_id)
            .await?;
        self.apply(&archive)?;
        info!(from = from_peer_id, created_at = archive.created_at, "restore applied");
        Ok(archive)
    }

    fn apply(&self, archive: &BackupArchive) -> Result<()> {
        if let Some(config) = archive.payload.get("config") {
            if let Some(settings) = config.get("settings") {
                self.db.kv_set(KV_SETTINGS, &serde_json::to_string(settings)?)?;
            }
            if let Some(targets) = config.get("backup_targets") {
                let targets: Vec<BackupTarget> = serde_json::from_value(targets.clone())?;
                for target in targets {
                    self.db.upsert_backup_target(&target)?;
                }
            }
        }
        if let Some(data) = archive.payload.get("data") {
            if let Some(entries) = data.get("registry_entries") {
                let entries: Vec<meshhub_common::RegistryEntry> =
                    serde_json::from_value(entries.clone())?;
                for entry in entries {
                    self.db.upsert_registry_entry(&entry)?;
                }
            }
            if let Some(services) = data.get("services") {
                let services: Vec<meshhub_common::ServiceRecord> =
                    serde_json::from_value(services.clone())?;
                for svc in services {
                    self.db.upsert_service(&svc)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    /// Fire scheduled backups. At-most-once per due time: a due slot that
    /// passes while the daemon is down is skipped, never replayed.
    pub async fn run_scheduler(self: Arc<Self>, token: CancellationToken) {
        let mut fired: HashMap<String, String> = HashMap::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("backup scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(SCHEDULER_TICK) => {}
            }
            self.scheduler_tick(Utc::now(), &mut fired).await;
        }
    }

    /// One scheduler pass: fire every due slot not already fired. Slots that
    /// elapsed before the first pass are simply never observed as due.
    async fn scheduler_tick(&self, now: DateTime<Utc>, fired: &mut HashMap<String, String>) {
        let targets = match self.db.list_backup_targets() {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "scheduler could not read targets");
                return;
            }
        };
        let due: Vec<String> = targets
            .iter()
            .filter_map(|t| {
                let spec = t.schedule.as_ref()?;
                if !is_due(spec, now) {
                    return None;
                }
                let key = due_key(spec, now);
                if fired.get(&t.peer_id) == Some(&key) {
                    return None;
                }
                fired.insert(t.peer_id.clone(), key);
                Some(t.peer_id.clone())
            })
            .collect();

        if !due.is_empty() {
            info!(targets = ?due, "scheduled backup firing");
            if let Err(e) = self
                .run_backup(vec![BackupScope::Config, BackupScope::Data], Some(due))
                .await
            {
                warn!(error = %e, "scheduled backup failed");
            }
        }
    }
}

/// Whether `now` falls in the schedule's due minute.
pub fn is_due(spec: &ScheduleSpec, now: DateTime<Utc>) -> bool {
    if now.minute() as u8 != spec.at_minute {
        return false;
    }
    match spec.frequency {
        ScheduleFrequency::Hourly => true,
        ScheduleFrequency::Daily => now.hour() as u8 == spec.at_hour,
        ScheduleFrequency::Weekly => {
            now.weekday() == Weekday::Sun && now.hour() as u8 == spec.at_hour
        }
    }
}

/// Identity of a due slot, used to fire at most once per slot.
fn due_key(spec: &ScheduleSpec, now: DateTime<Utc>) -> String {
    match spec.frequency {
        ScheduleFrequency::Hourly => format!("{}-{}", now.date_naive(), now.hour()),
        ScheduleFrequency::Daily => now.date_naive().to_string(),
        ScheduleFrequency::Weekly => format!("{}-w{}", now.iso_week().year(), now.iso_week().week()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use chrono::TimeZone;
    use meshhub_common::NodeAnnouncement;

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

    async fn setup(peers: &[(&str, &str)]) -> (Arc<MockTransport>, Arc<Membership>, Arc<BackupCoordinator>) {
        let transport = Arc::new(MockTransport::new());
        let db = Database::open_memory().unwrap();
        let membership = Arc::new(
            Membership::new(db.clone(), transport.clone(), local_announcement()).unwrap(),
        );
        for (id, address) in peers {
            transport.announce_node(address, id, &format!("node-{}", id));
            membership.add_peer(address, None).await.unwrap();
        }
        let coordinator = Arc::new(BackupCoordinator::new(
            db,
            membership.clone(),
            transport.clone(),
            Duration::from_secs(2),
            3,
        ));
        (transport, membership, coordinator)
    }

    #[tokio::test]
    async fn target_must_be_a_member() {
        let (_, _, coordinator) = setup(&[]).await;
        assert!(matches!(
            coordinator.add_target("ghost", None, 3).unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn partial_failure_is_reported_per_target() {
        let (transport, _, coordinator) =
            setup(&[("pa", "10.0.0.2:8787"), ("pb", "10.0.0.3:8787")]).await;
        coordinator.add_target("pa", None, 3).unwrap();
        coordinator.add_target("pb", None, 3).unwrap();
        transport.set_unreachable("10.0.0.3:8787", true);

        let report = coordinator
            .run_backup(vec![BackupScope::Config], None)
            .await
            .unwrap();
        assert!(!report.fully_succeeded());
        assert!(!report.fully_failed());
        let by_id: HashMap<&str, &TargetReport> = report
            .targets
            .iter()
            .map(|t| (t.peer_id.as_str(), t))
            .collect();
        assert!(by_id["pa"].ok);
        assert!(!by_id["pb"].ok);
        assert!(by_id["pb"].error.is_some());

        let targets = coordinator.list_targets().unwrap();
        let pa = targets.iter().find(|t| t.peer_id == "pa").unwrap();
        let pb = targets.iter().find(|t| t.peer_id == "pb").unwrap();
        assert!(pa.synced && pa.last_synced_at.is_some());
        assert!(!pb.synced && pb.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn removal_mid_backup_aborts_that_target() {
        let (transport, membership, coordinator) =
            setup(&[("pa", "10.0.0.2:8787"), ("pb", "10.0.0.3:8787")]).await;
        coordinator.add_target("pa", None, 3).unwrap();
        coordinator.add_target("pb", None, 3).unwrap();
        transport.set_delay("10.0.0.3:8787", 300);

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run_backup(vec![BackupScope::Data], None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        membership.remove_peer("pb").unwrap();

        let report = run.await.unwrap().unwrap();
        let pb = report.targets.iter().find(|t| t.peer_id == "pb").unwrap();
        assert!(!pb.ok);
        assert!(pb.error.as_ref().unwrap().contains("removed"));
        let pa = report.targets.iter().find(|t| t.peer_id == "pa").unwrap();
        assert!(pa.ok);
    }

    #[tokio::test]
    async fn run_can_address_a_subset_of_targets() {
        let (transport, _, coordinator) =
            setup(&[("pa", "10.0.0.2:8787"), ("pb", "10.0.0.3:8787")]).await;
        coordinator.add_target("pa", None, 3).unwrap();
        coordinator.add_target("pb", None, 3).unwrap();

        let report = coordinator
            .run_backup(vec![BackupScope::Config], Some(vec!["pb".to_string()]))
            .await
            .unwrap();
        assert_eq!(report.targets.len(), 1);
        assert_eq!(report.targets[0].peer_id, "pb");
        let pushed = transport.pushed_backups.lock();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "10.0.0.3:8787");
    }

    #[tokio::test]
    async fn run_rejects_unconfigured_target_ids() {
        let (transport, _, coordinator) = setup(&[("pa", "10.0.0.2:8787")]).await;
        coordinator.add_target("pa", None, 3).unwrap();

        let err = coordinator
            .run_backup(
                vec![BackupScope::Config],
                Some(vec!["pa".to_string(), "ghost".to_string()]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(transport.pushed_backups.lock().is_empty());
    }

    #[tokio::test]
    async fn scheduler_fires_each_slot_once_and_never_replays() {
        let (transport, _, coordinator) = setup(&[("pa", "10.0.0.2:8787")]).await;
        coordinator
            .add_target(
                "pa",
                Some(ScheduleSpec {
                    frequency: ScheduleFrequency::Hourly,
                    at_hour: 0,
                    at_minute: 15,
                }),
                3,
            )
            .unwrap();
        let at = |h, m| Utc.with_ymd_and_hms(2026, 8, 28, h, m, 0).unwrap();
        let mut fired = HashMap::new();

        // First pass lands after the 09:15 slot elapsed: no catch-up run.
        coordinator.scheduler_tick(at(9, 16), &mut fired).await;
        assert!(transport.pushed_backups.lock().is_empty());

        // The next slot fires once, even across repeated passes in the
        // same minute.
        coordinator.scheduler_tick(at(10, 15), &mut fired).await;
        assert_eq!(transport.pushed_backups.lock().len(), 1);
        coordinator.scheduler_tick(at(10, 15), &mut fired).await;
        assert_eq!(transport.pushed_backups.lock().len(), 1);

        coordinator.scheduler_tick(at(11, 15), &mut fired).await;
        assert_eq!(transport.pushed_backups.lock().len(), 2);
    }

    #[tokio::test]
    async fn restore_requires_matching_token() {
        let (transport, _, coordinator) = setup(&[("pa", "10.0.0.2:8787")]).await;
        assert!(matches!(
            coordinator.restore("pa", "restore-pb").await.unwrap_err(),
            Error::RestoreNotConfirmed(_)
        ));

        transport.served_backups.lock().insert(
            "10.0.0.2:8787".to_string(),
            BackupArchive {
                from_node: "local".to_string(),
                scopes: vec![BackupScope::Config],
                created_at: 42,
                payload: serde_json::json!({
                    "config": {"settings": {"sharing_enabled": false, "display_name": null,
                                             "base_domain": "mesh.local", "pairing_secret": null}}
                }),
            },
        );
        let archive = coordinator.restore("pa", "restore-pa").await.unwrap();
        assert_eq!(archive.created_at, 42);
        let settings = coordinator.db.kv_get(KV_SETTINGS).unwrap().unwrap();
        assert!(settings.contains("\"sharing_enabled\":false"));
    }

    #[tokio::test]
    async fn receive_prunes_old_archives() {
        let (_, _, coordinator) = setup(&[]).await;
        for i in 0..5 {
            coordinator
                .receive(&BackupArchive {
                    from_node: "px".to_string(),
                    scopes: vec![BackupScope::Data],
                    created_at: i,
                    payload: serde_json::json!({}),
                })
                .unwrap();
        }
        let latest = coordinator.serve("px").unwrap();
        assert_eq!(latest.created_at, 4);
        assert!(matches!(
            coordinator.serve("unknown").unwrap_err(),
            Error::NoBackupAvailable { .. }
        ));
    }

    #[test]
    fn schedule_due_matching() {
        let daily = ScheduleSpec {
            frequency: ScheduleFrequency::Daily,
            at_hour: 3,
            at_minute: 30,
        };
        let at = |h, m| Utc.with_ymd_and_hms(2026, 8, 28, h, m, 0).unwrap();
        assert!(is_due(&daily, at(3, 30)));
        assert!(!is_due(&daily, at(3, 31)));
        assert!(!is_due(&daily, at(4, 30)));

        let hourly = ScheduleSpec {
            frequency: ScheduleFrequency::Hourly,
            at_hour: 0,
            at_minute: 15,
        };
        assert!(is_due(&hourly, at(9, 15)));
        assert!(is_due(&hourly, at(22, 15)));
        assert!(!is_due(&hourly, at(22, 16)));

        let weekly = ScheduleSpec {
            frequency: ScheduleFrequency::Weekly,
            at_hour: 4,
            at_minute: 0,
        };
        // 2026-08-30 is a Sunday.
        assert!(is_due(
            &weekly,
            Utc.with_ymd_and_hms(2026, 8, 30, 4, 0, 0).unwrap()
        ));
        assert!(!is_due(&weekly, at(4, 0)));
    }

    #[test]
    fn due_keys_identify_slots() {
        let hourly = ScheduleSpec {
            frequency: ScheduleFrequency::Hourly,
            at_hour: 0,
            at_minute: 15,
        };
        let at = |h, m| Utc.with_ymd_and_hms(2026, 8, 28, h, m, 0).unwrap();
        assert_eq!(due_key(&hourly, at(9, 15)), due_key(&hourly, at(9, 15)));
        assert_ne!(due_key(&hourly, at(9, 15)), due_key(&hourly, at(10, 15)));
    }
}
