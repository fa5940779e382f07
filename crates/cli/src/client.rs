//! HTTP client for the coordinator API

use anyhow::{anyhow, Context, Result};
use meshhub_common::{
    BackupArchive, BackupReport, BackupScope, BackupTarget, BroadcastOutcome, DnsZone, Endpoint,
    HealthSummary, LoadBalancerConfig, Peer, RegistryEntry, RegistryKind, ScheduleSpec,
    ServiceRecord, Settings, SyncReport, ZoneSyncReport,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A backup target as listed by the API, restore token included.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackupTargetView {
    pub target: BackupTarget,
    pub restore_token: String,
}

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(addr: &str) -> Result<Self> {
        let base = addr.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(90))
            .build()
            .context("building HTTP client")?;
        Ok(Self { base, http })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.context("decoding response");
        }
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("unknown error").to_string();
        Err(anyhow!("{} ({})", message, status))
    }

    async fn expect_ok(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("unknown error").to_string();
        Err(anyhow!("{} ({})", message, status))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .with_context(|| format!("GET {}", path))?;
        Self::decode(response).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {}", path))?;
        Self::decode(response).await
    }

    // ========================================================================
    // Health and peers
    // ========================================================================

    pub async fn health(&self) -> Result<HealthSummary> {
        self.get("/health").await
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.get("/peers").await
    }

    pub async fn add_peer(&self, address: &str, name: Option<String>) -> Result<Peer> {
        self.post(
            "/peers",
            &serde_json::json!({ "address": address, "name": name }),
        )
        .await
    }

    pub async fn remove_peer(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/peers/{}", self.base, id))
            .send()
            .await
            .context("DELETE /peers")?;
        Self::expect_ok(response).await
    }

    pub async fn discover(&self, timeout_seconds: Option<u64>) -> Result<Vec<Peer>> {
        self.post(
            "/peers/discover",
            &serde_json::json!({ "timeout_seconds": timeout_seconds }),
        )
        .await
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub async fn list_services(&self, mesh_only: bool) -> Result<Vec<ServiceRecord>> {
        if mesh_only {
            self.get("/services/mesh").await
        } else {
            self.get("/services").await
        }
    }

    pub async fn register_service(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        shared: bool,
    ) -> Result<ServiceRecord> {
        self.post(
            "/services",
            &serde_json::json!({
                "name": name,
                "type": service_type,
                "port": port,
                "shared": shared,
            }),
        )
        .await
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub async fn list_registry(&self) -> Result<Vec<RegistryEntry>> {
        self.get("/registry").await
    }

    pub async fn publish(
        &self,
        short_path: &str,
        target: &str,
        kind: RegistryKind,
        cache_ttl: Option<u64>,
    ) -> Result<RegistryEntry> {
        self.post(
            "/registry",
            &serde_json::json!({
                "short_path": short_path,
                "target": target,
                "kind": kind,
                "cache_ttl": cache_ttl,
            }),
        )
        .await
    }

    pub async fn unpublish(&self, short_path: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!(
                "{}/registry/entries/{}",
                self.base,
                short_path.trim_matches('/')
            ))
            .send()
            .await
            .context("DELETE /registry/entries")?;
        Self::expect_ok(response).await
    }

    pub async fn resolve(&self, short_path: &str) -> Result<RegistryEntry> {
        self.get(&format!(
            "/registry/resolve/{}",
            short_path.trim_matches('/')
        ))
        .await
    }

    pub async fn registry_sync(&self) -> Result<SyncReport> {
        self.post("/registry/sync", &serde_json::json!({})).await
    }

    pub async fn flush_cache(&self) -> Result<serde_json::Value> {
        self.post("/registry/flush", &serde_json::json!({})).await
    }

    // ========================================================================
    // DNS
    // ========================================================================

    pub async fn zone(&self) -> Result<DnsZone> {
        self.get("/dns/zone").await
    }

    pub async fn regenerate_zone(&self) -> Result<serde_json::Value> {
        self.post("/dns/regenerate", &serde_json::json!({})).await
    }

    pub async fn zone_sync(&self) -> Result<ZoneSyncReport> {
        self.post("/dns/sync", &serde_json::json!({})).await
    }

    // ========================================================================
    // Load balancer
    // ========================================================================

    pub async fn lb_config(&self, service: &str) -> Result<LoadBalancerConfig> {
        self.get(&format!("/lb/{}/config", service)).await
    }

    pub async fn set_lb_config(&self, service: &str, config: &LoadBalancerConfig) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/lb/{}/config", self.base, service))
            .json(config)
            .send()
            .await
            .context("PUT /lb config")?;
        Self::expect_ok(response).await
    }

    pub async fn lb_endpoints(&self, service: &str) -> Result<Vec<Endpoint>> {
        self.get(&format!("/lb/{}/endpoints", service)).await
    }

    pub async fn lb_acquire(&self, service: &str) -> Result<Endpoint> {
        self.post(&format!("/lb/{}/acquire", service), &serde_json::json!({}))
            .await
    }

    // ========================================================================
    // Backup
    // ========================================================================

    pub async fn backup_targets(&self) -> Result<Vec<BackupTargetView>> {
        self.get("/backup/targets").await
    }

    pub async fn add_backup_target(
        &self,
        peer_id: &str,
        schedule: Option<ScheduleSpec>,
        retention: u32,
    ) -> Result<BackupTarget> {
        self.post(
            "/backup/targets",
            &serde_json::json!({
                "peer_id": peer_id,
                "schedule": schedule,
                "retention": retention,
            }),
        )
        .await
    }

    pub async fn remove_backup_target(&self, peer_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/backup/targets/{}", self.base, peer_id))
            .send()
            .await
            .context("DELETE /backup/targets")?;
        Self::expect_ok(response).await
    }

    pub async fn run_backup(
        &self,
        scopes: Vec<BackupScope>,
        targets: Option<Vec<String>>,
    ) -> Result<BackupReport> {
        self.post(
            "/backup/run",
            &serde_json::json!({ "scopes": scopes, "targets": targets }),
        )
        .await
    }

    pub async fn restore(&self, from_peer_id: &str, confirm: &str) -> Result<BackupArchive> {
        self.post(
            "/backup/restore",
            &serde_json::json!({ "from_peer_id": from_peer_id, "confirm": confirm }),
        )
        .await
    }

    // ========================================================================
    // Broadcast and settings
    // ========================================================================

    pub async fn broadcast(
        &self,
        kind: &str,
        arg: Option<String>,
        peer_ids: Option<Vec<String>>,
    ) -> Result<HashMap<String, BroadcastOutcome>> {
        self.post(
            "/broadcast",
            &serde_json::json!({ "kind": kind, "arg": arg, "peer_ids": peer_ids }),
        )
        .await
    }

    pub async fn settings(&self) -> Result<Settings> {
        self.get("/settings").await
    }

    pub async fn put_settings(&self, settings: &Settings) -> Result<Settings> {
        let response = self
            .http
            .put(format!("{}/settings", self.base))
            .json(settings)
            .send()
            .await
            .context("PUT /settings")?;
        Self::decode(response).await
    }
}
