//! Load balancing across peer-hosted service endpoints
//!
//! Endpoints for a service are every node that shares a service record of
//! that name. Endpoint health is tracked per endpoint from reported call
//! outcomes, deliberately separate from peer-level health: a degraded peer
//! can still serve one service fine while another is down.

use crate::membership::Membership;
use meshhub_common::{
    Database, Endpoint, Error, LbStrategy, LoadBalancerConfig, Result, ServiceRecord,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const KV_LB_CONFIGS: &str = "lb_configs";

/// Consecutive reported failures before an endpoint is skipped.
const ENDPOINT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default)]
struct EndpointState {
    active_connections: u32,
    consecutive_failures: u32,
}

impl EndpointState {
    fn healthy(&self) -> bool {
        self.consecutive_failures < ENDPOINT_FAILURE_THRESHOLD
    }
}

#[derive(Default)]
struct ServiceLb {
    rr_index: usize,
    endpoints: HashMap<String, EndpointState>,
}

pub struct LoadBalancer {
    db: Database,
    membership: Arc<Membership>,
    services: RwLock<HashMap<String, ServiceLb>>,
    configs: RwLock<HashMap<String, LoadBalancerConfig>>,
}

impl LoadBalancer {
    pub fn new(db: Database, membership: Arc<Membership>) -> Result<Self> {
        let configs: HashMap<String, LoadBalancerConfig> = db
            .kv_get(KV_LB_CONFIGS)?
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default();
        Ok(Self {
            db,
            membership,
            services: RwLock::new(HashMap::new()),
            configs: RwLock::new(configs),
        })
    }

    pub async fn config(&self, service: &str) -> LoadBalancerConfig {
        self.configs
            .read()
            .await
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_config(&self, service: &str, config: LoadBalancerConfig) -> Result<()> {
        let mut configs = self.configs.write().await;
        configs.insert(service.to_string(), config);
        self.db
            .kv_set(KV_LB_CONFIGS, &serde_json::to_string(&*configs)?)?;
        info!(service, "load balancer config updated");
        Ok(())
    }

    /// Current endpoints for a service, with live counters.
    pub async fn endpoints(&self, service: &str) -> Result<Vec<Endpoint>> {
        let config = self.config(service).await;
        let candidates = self.candidates(service, &config)?;
        let services = self.services.read().await;
        let state = services.get(service);
        Ok(candidates
            .into_iter()
            .map(|mut ep| {
                if let Some(st) = state.and_then(|s| s.endpoints.get(&ep.peer_id)) {
                    ep.active_connections = st.active_connections;
                    ep.healthy = st.healthy();
                }
                ep
            })
            .collect())
    }

    /// Pick an endpoint for a request and count a connection against it.
    /// Callers report the outcome with `release`.
    pub async fn acquire(&self, service: &str) -> Result<Endpoint> {
        let config = self.config(service).await;
        let candidates = self.candidates(service, &config)?;

        let mut services = self.services.write().await;
        let lb = services.entry(service.to_string()).or_default();

        let mut healthy: Vec<Endpoint> = candidates
            .into_iter()
            .map(|mut ep| {
                let st = lb.endpoints.entry(ep.peer_id.clone()).or_default();
                ep.active_connections = st.active_connections;
                ep.healthy = st.healthy();
                ep
            })
            .filter(|ep| ep.healthy)
            .collect();
        // Deterministic base order; strategies and tie-breaks build on it.
        healthy.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        if healthy.is_empty() {
            return Err(Error::NoHealthyEndpoint {
                service: service.to_string(),
            });
        }

        let chosen = match config.strategy {
            LbStrategy::RoundRobin => {
                let pick = healthy[lb.rr_index % healthy.len()].clone();
                lb.rr_index = lb.rr_index.wrapping_add(1);
                pick
            }
            LbStrategy::LeastConn => healthy
                .iter()
                .min_by_key(|ep| (ep.active_connections, ep.peer_id.clone()))
                .cloned()
                .ok_or_else(|| Error::NoHealthyEndpoint {
                    service: service.to_string(),
                })?,
            LbStrategy::Weighted => weighted_pick(&healthy),
            LbStrategy::Failover => healthy
                .iter()
                .min_by_key(|ep| (ep.priority, ep.peer_id.clone()))
                .cloned()
                .ok_or_else(|| Error::NoHealthyEndpoint {
                    service: service.to_string(),
                })?,
        };

        if let Some(st) = lb.endpoints.get_mut(&chosen.peer_id) {
            st.active_connections += 1;
        }
        debug!(service, endpoint = %chosen.peer_id, strategy = %config.strategy, "endpoint acquired");
        Ok(chosen)
    }

    /// Report the outcome of a call and release its connection slot.
    pub async fn release(&self, service: &str, peer_id: &str, success: bool) {
        let mut services = self.services.write().await;
        let Some(lb) = services.get_mut(service) else {
            return;
        };
        let Some(st) = lb.endpoints.get_mut(peer_id) else {
            return;
        };
        st.active_connections = st.active_connections.saturating_sub(1);
        if success {
            st.consecutive_failures = 0;
        } else {
            st.consecutive_failures += 1;
            if st.consecutive_failures == ENDPOINT_FAILURE_THRESHOLD {
                warn!(service, endpoint = peer_id, "endpoint marked unhealthy");
            }
        }
    }

    /// Endpoints derived from shared service records, with config overrides
    /// applied on top.
    fn candidates(&self, service: &str, config: &LoadBalancerConfig) -> Result<Vec<Endpoint>> {
        let local = self.membership.local();
        let records: Vec<ServiceRecord> = self
            .db
            .list_services()?
            .into_iter()
            .filter(|s| s.name == service && s.shared)
            .collect();
        if records.is_empty() {
            return Err(Error::not_found("service", service));
        }

        let mut endpoints = Vec::new();
        for record in records {
            let address = if record.owner_peer_id == local.id {
                host_of(&local.address)
            } else {
                match self.membership.get(&record.owner_peer_id) {
                    Some(peer) => host_of(&peer.address),
                    None => continue, // owner left the mesh
                }
            };
            let over = config
                .endpoints
                .iter()
                .find(|o| o.peer_id == record.owner_peer_id);
            endpoints.push(Endpoint {
                peer_id: record.owner_peer_id.clone(),
                address: format!("{}:{}", address, record.port),
                weight: over.map(|o| o.weight).unwrap_or(1),
                priority: over.map(|o| o.priority).unwrap_or(0),
                active_connections: 0,
                healthy: true,
            });
        }
        Ok(endpoints)
    }
}

fn weighted_pick(healthy: &[Endpoint]) -> Endpoint {
    let total: u64 = healthy.iter().map(|ep| ep.weight.max(1) as u64).sum();
    let mut roll = rand::thread_rng().gen_range(0..total);
    for ep in healthy {
        let w = ep.weight.max(1) as u64;
        if roll < w {
            return ep.clone();
        }
        roll -= w;
    }
    healthy[healthy.len() - 1].clone()
}

fn host_of(address: &str) -> String {
    address
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| address.to_string())
}
