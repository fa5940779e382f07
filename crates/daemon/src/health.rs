//! Peer health monitoring
//!
//! One prober task per peer, started when the peer joins and stopped through
//! the peer's cancellation token when it leaves. Probe intervals are jittered
//! so a large mesh does not probe in lockstep.
//!
//! Transitions are asymmetric: a peer needs `offline_threshold` consecutive
//! failed rounds to reach `Offline` (passing through `Degraded`), but a
//! single successful probe returns it to `Online` from either state.

use crate::config::HealthConfig;
use crate::membership::{Membership, MembershipEvent};
use crate::transport::PeerTransport;
use meshhub_common::{Error, Peer, PeerStatus, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct HealthMonitor {
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    config: HealthConfig,
}

/// Consecutive-failure counter and the status it implies.
#[derive(Debug, Default)]
pub struct ProbeState {
    failures: u32,
}

impl ProbeState {
    pub fn on_success(&mut self) -> PeerStatus {
        self.failures = 0;
        PeerStatus::Online
    }

    pub fn on_failure(&mut self, offline_threshold: u32) -> PeerStatus {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= offline_threshold {
            PeerStatus::Offline
        } else {
            PeerStatus::Degraded
        }
    }
}

impl HealthMonitor {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        config: HealthConfig,
    ) -> Self {
        Self {
            membership,
            transport,
            config,
        }
    }

    /// Start probers for current peers and watch membership for changes.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut events = self.membership.subscribe();
        for peer in self.membership.list() {
            self.spawn_prober(peer);
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("health monitor stopped");
                    return;
                }
                event = events.recv() => match event {
                    Ok(MembershipEvent::PeerAdded(peer)) => self.spawn_prober(peer),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "membership event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    fn spawn_prober(&self, peer: Peer) {
        let Some(peer_token) = self.membership.cancellation(&peer.id) else {
            return;
        };
        let membership = self.membership.clone();
        let transport = self.transport.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            debug!(peer = %peer.id, "prober started");
            let mut state = ProbeState::default();
            loop {
                let interval = jittered_interval(&config);
                tokio::select! {
                    _ = peer_token.cancelled() => {
                        debug!(peer = %peer.id, "prober stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                let status = match probe_round(
                    transport.as_ref(),
                    &peer.address,
                    Duration::from_secs(config.probe_timeout_seconds),
                )
                .await
                {
                    Ok(ann) => {
                        let _ = membership.record_announcement(&peer.id, &ann);
                        state.on_success()
                    }
                    Err(e) => {
                        debug!(peer = %peer.id, error = %e, "probe failed");
                        state.on_failure(config.offline_threshold)
                    }
                };

                if membership.set_status(&peer.id, status).is_err() {
                    // Peer was removed under us.
                    return;
                }
            }
        });
    }
}

/// One probe round: a ping with a deadline, retried once for transient
/// failures so a single dropped packet does not degrade the peer.
pub async fn probe_round(
    transport: &dyn PeerTransport,
    address: &str,
    timeout: Duration,
) -> Result<meshhub_common::NodeAnnouncement> {
    match probe_once(transport, address, timeout).await {
        Ok(ann) => Ok(ann),
        Err(e) if e.is_transient() => {
            debug!(address, error = %e, "retrying probe");
            probe_once(transport, address, timeout).await
        }
        Err(e) => Err(e),
    }
}

async fn probe_once(
    transport: &dyn PeerTransport,
    address: &str,
    timeout: Duration,
) -> Result<meshhub_common::NodeAnnouncement> {
    match tokio::time::timeout(timeout, transport.ping(address)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            seconds: timeout.as_secs(),
        }),
    }
}

fn jittered_interval(config: &HealthConfig) -> Duration {
    let base = config.interval_seconds as f64;
    let spread = base * config.jitter_fraction;
    let jitter = if spread > 0.0 {
        rand::thread_rng().gen_range(-spread..spread)
    } else {
        0.0
    };
    Duration::from_secs_f64((base + jitter).max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn offline_needs_consecutive_failures() {
        let mut state = ProbeState::default();
        assert_eq!(state.on_failure(3), PeerStatus::Degraded);
        assert_eq!(state.on_failure(3), PeerStatus::Degraded);
        assert_eq!(state.on_failure(3), PeerStatus::Offline);
        assert_eq!(state.on_failure(3), PeerStatus::Offline);
    }

    #[test]
    fn single_success_restores_online() {
        let mut state = ProbeState::default();
        for _ in 0..5 {
            state.on_failure(3);
        }
        assert_eq!(state.on_success(), PeerStatus::Online);
        // Counter was reset, so the next failure starts over at degraded.
        assert_eq!(state.on_failure(3), PeerStatus::Degraded);
    }

    #[tokio::test]
    async fn probe_round_retries_transient_failure_once() {
        let transport = MockTransport::new();
        transport.set_unreachable("10.0.0.2:8787", true);

        let err = probe_round(&transport, "10.0.0.2:8787", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { .. }));
        assert_eq!(
            *transport.ping_counts.lock().get("10.0.0.2:8787").unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn probe_round_succeeds_without_retry() {
        let transport = MockTransport::new();
        transport.announce_node("10.0.0.2:8787", "p2", "node-two");

        let ann = probe_round(&transport, "10.0.0.2:8787", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ann.id, "p2");
        assert_eq!(
            *transport.ping_counts.lock().get("10.0.0.2:8787").unwrap(),
            1
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = HealthConfig {
            interval_seconds: 30,
            jitter_fraction: 0.2,
            offline_threshold: 3,
            probe_timeout_seconds: 5,
        };
        for _ in 0..100 {
            let d = jittered_interval(&config).as_secs_f64();
            assert!((24.0..=36.0).contains(&d), "interval out of bounds: {}", d);
        }
    }
}
