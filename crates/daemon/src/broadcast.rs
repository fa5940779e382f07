//! Command broadcast across the mesh
//!
//! Fans an administrative command out to a peer subset concurrently. Each
//! delivery is bounded by its own timeout, so one stuck peer delays the whole
//! dispatch by at most that bound, and a peer removed mid-flight reports
//! `PeerRemoved` instead of a stale outcome.

use crate::membership::Membership;
use crate::transport::PeerTransport;
use futures::future::join_all;
use meshhub_common::{BroadcastCommand, BroadcastOutcome, Error, Peer, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct Broadcaster {
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    dispatch_timeout: Duration,
}

impl Broadcaster {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            transport,
            dispatch_timeout,
        }
    }

    /// Dispatch a command to the given peers, or to every peer when `None`.
    pub async fn broadcast(
        &self,
        command: BroadcastCommand,
        peer_ids: Option<Vec<String>>,
    ) -> Result<HashMap<String, BroadcastOutcome>> {
        let targets: Vec<Peer> = match peer_ids {
            None => self.membership.list(),
            Some(ids) => {
                let mut peers = Vec::with_capacity(ids.len());
                for id in ids {
                    peers.push(
                        self.membership
                            .get(&id)
                            .ok_or_else(|| Error::not_found("peer", id))?,
                    );
                }
                peers
            }
        };

        info!(command = %command.kind, targets = targets.len(), "broadcasting");
        let dispatches = targets.iter().map(|peer| {
            let command = &command;
            async move {
                let start = Instant::now();
                let outcome = self.dispatch(peer, command).await;
                (peer.id.clone(), outcome, start.elapsed())
            }
        });

        let mut results = HashMap::new();
        for (peer_id, outcome, elapsed) in join_all(dispatches).await {
            let ok = outcome.is_ok();
            let error = outcome.err().map(|e| e.to_string());
            if let Some(err) = &error {
                warn!(peer = %peer_id, error = err, "command delivery failed");
            }
            results.insert(
                peer_id,
                BroadcastOutcome {
                    ok,
                    error,
                    duration_ms: elapsed.as_millis() as u64,
                },
            );
        }
        Ok(results)
    }

    async fn dispatch(&self, peer: &Peer, command: &BroadcastCommand) -> Result<()> {
        let token = self
            .membership
            .cancellation(&peer.id)
            .ok_or(Error::PeerRemoved {
                id: peer.id.clone(),
            })?;
        tokio::select! {
            _ = token.cancelled() => Err(Error::PeerRemoved { id: peer.id.clone() }),
            sent = tokio::time::timeout(
                self.dispatch_timeout,
                self.transport.send_command(&peer.address, command),
            ) => match sent {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { seconds: self.dispatch_timeout.as_secs() }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use meshhub_common::{CommandKind, Database, NodeAnnouncement};

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

    async fn setup(peers: &[(&str, &str)]) -> (Arc<MockTransport>, Arc<Membership>, Broadcaster) {
        let transport = Arc::new(MockTransport::new());
        let db = Database::open_memory().unwrap();
        let membership = Arc::new(
            Membership::new(db, transport.clone(), local_announcement()).unwrap(),
        );
        for (id, address) in peers {
            transport.announce_node(address, id, &format!("node-{}", id));
            membership.add_peer(address, None).await.unwrap();
        }
        let broadcaster = Broadcaster::new(
            membership.clone(),
            transport.clone(),
            Duration::from_millis(200),
        );
        (transport, membership, broadcaster)
    }

    fn sync_command() -> BroadcastCommand {
        BroadcastCommand {
            kind: CommandKind::Sync,
            arg: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_all_peers_by_default() {
        let (transport, _, broadcaster) =
            setup(&[("pa", "10.0.0.2:8787"), ("pb", "10.0.0.3:8787")]).await;
        let results = broadcaster.broadcast(sync_command(), None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|o| o.ok));
        assert_eq!(transport.commands.lock().len(), 2);
    }

    #[tokio::test]
    async fn slow_peer_times_out_without_blocking_others() {
        let (transport, _, broadcaster) =
            setup(&[("pa", "10.0.0.2:8787"), ("pb", "10.0.0.3:8787")]).await;
        transport.set_delay("10.0.0.3:8787", 2_000);

        let start = Instant::now();
        let results = broadcaster.broadcast(sync_command(), None).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(results["pa"].ok);
        assert!(!results["pb"].ok);
        assert!(results["pb"].error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_target_fails_the_call() {
        let (_, _, broadcaster) = setup(&[("pa", "10.0.0.2:8787")]).await;
        let err = broadcaster
            .broadcast(sync_command(), Some(vec!["ghost".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn removal_mid_dispatch_reports_peer_removed() {
        let (transport, membership, broadcaster) =
            setup(&[("pa", "10.0.0.2:8787")]).await;
        transport.set_delay("10.0.0.2:8787", 150);

        let run = tokio::spawn(async move {
            broadcaster.broadcast(sync_command(), None).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        membership.remove_peer("pa").unwrap();

        let results = run.await.unwrap().unwrap();
        assert!(!results["pa"].ok);
        assert!(results["pa"].error.as_ref().unwrap().contains("removed"));
    }

    #[tokio::test]
    async fn subset_targets_only_those_peers() {
        let (transport, _, broadcaster) =
            setup(&[("pa", "10.0.0.2:8787"), ("pb", "10.0.0.3:8787")]).await;
        let results = broadcaster
            .broadcast(
                BroadcastCommand {
                    kind: CommandKind::Custom,
                    arg: Some("opkg update".to_string()),
                },
                Some(vec!["pb".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let commands = transport.commands.lock();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, "10.0.0.3:8787");
        assert_eq!(commands[0].1.kind, CommandKind::Custom);
    }
}
