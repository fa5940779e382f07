//! UDP peer discovery
//!
//! Single-subnet discovery over broadcast JSON datagrams: a probe goes out to
//! the broadcast address, and every coordinator running a responder replies
//! with its self-announcement. Callers feed the collected announcements into
//! `Membership::merge_discovered`, which inserts unknown nodes and refreshes
//! known ones.

use meshhub_common::{NodeAnnouncement, Result};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryMessage {
    /// Broadcast request for announcements
    Probe { from: String },
    /// Unicast reply carrying the responder's self-announcement
    Announce { node: NodeAnnouncement },
}

/// Bind a UDP socket with address reuse, so responder and prober can coexist.
fn bind_reuse(addr: SocketAddrV4) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Answer discovery probes with our announcement until cancelled.
pub async fn run_responder(
    port: u16,
    local: NodeAnnouncement,
    token: CancellationToken,
) -> Result<()> {
    let std_socket = bind_reuse(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    let socket = UdpSocket::from_std(std_socket)?;
    info!(port, "discovery responder listening");

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = token.cancelled() => {
                info!("discovery responder stopped");
                return Ok(());
            }
            recv = socket.recv_from(&mut buf) => recv?,
        };

        let msg: DiscoveryMessage = match serde_json::from_slice(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%from, error = %e, "ignoring malformed discovery datagram");
                continue;
            }
        };

        if let DiscoveryMessage::Probe { from: prober } = msg {
            if prober == local.id {
                continue;
            }
            debug!(%from, prober, "answering discovery probe");
            let reply = serde_json::to_vec(&DiscoveryMessage::Announce {
                node: local.clone(),
            })?;
            if let Err(e) = socket.send_to(&reply, from).await {
                warn!(%from, error = %e, "discovery reply failed");
            }
        }
    }
}

/// Broadcast a probe and collect announcements until the window closes.
pub async fn discover(
    port: u16,
    window: Duration,
    local: &NodeAnnouncement,
) -> Result<Vec<NodeAnnouncement>> {
    let std_socket = bind_reuse(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    let socket = UdpSocket::from_std(std_socket)?;
    socket.set_broadcast(true)?;

    let probe = serde_json::to_vec(&DiscoveryMessage::Probe {
        from: local.id.clone(),
    })?;
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, port));
    socket.send_to(&probe, target).await?;
    debug!(port, "discovery probe sent");

    let deadline = tokio::time::Instant::now() + window;
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut found: Vec<NodeAnnouncement> = Vec::new();

    loop {
        let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let (len, from) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "discovery receive failed");
                break;
            }
            Err(_) => break, // window closed
        };

        match serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) {
            Ok(DiscoveryMessage::Announce { node }) => {
                debug!(%from, node = %node.id, "discovery reply");
                merge_announcement(&mut found, node, &local.id);
            }
            Ok(DiscoveryMessage::Probe { .. }) => {}
            Err(e) => {
                debug!(%from, error = %e, "ignoring malformed discovery reply");
            }
        }
    }

    info!(count = found.len(), "discovery window closed");
    Ok(found)
}

/// Deduplicate replies by node id, dropping our own echo.
fn merge_announcement(found: &mut Vec<NodeAnnouncement>, node: NodeAnnouncement, local_id: &str) {
    if node.id == local_id {
        return;
    }
    if found.iter().any(|n| n.id == node.id) {
        return;
    }
    found.push(node);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(id: &str) -> NodeAnnouncement {
        NodeAnnouncement {
            id: id.to_string(),
            name: format!("node-{}", id),
            address: format!("10.0.0.{}:8787", id.len()),
            capabilities: Vec::new(),
            apps_count: 0,
            services_count: 0,
            version: "test".to_string(),
        }
    }

    #[test]
    fn message_wire_format_is_tagged() {
        let probe = serde_json::to_value(&DiscoveryMessage::Probe {
            from: "n1".to_string(),
        })
        .unwrap();
        assert_eq!(probe["type"], "probe");

        let announce = serde_json::to_value(&DiscoveryMessage::Announce { node: ann("n2") })
            .unwrap();
        assert_eq!(announce["type"], "announce");
        assert_eq!(announce["node"]["id"], "n2");
    }

    #[test]
    fn merge_drops_self_and_duplicates() {
        let mut found = Vec::new();
        merge_announcement(&mut found, ann("local"), "local");
        merge_announcement(&mut found, ann("p1"), "local");
        merge_announcement(&mut found, ann("p1"), "local");
        merge_announcement(&mut found, ann("p2"), "local");
        let ids: Vec<&str> = found.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }
}
