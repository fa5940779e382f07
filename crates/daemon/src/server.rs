//! HTTP API
//!
//! Two surfaces share one router: the operator API (peers, registry, dns,
//! lb, backup, broadcast, settings) and the `/mesh/*` protocol other
//! coordinators speak to us.

use crate::discovery;
use crate::state::Coordinator;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use meshhub_common::{
    BackupArchive, BackupScope, BroadcastCommand, CommandKind, Error, LoadBalancerConfig,
    RegistryKind, RuntimeStatus, ScheduleSpec, ServiceRecord, ServiceType, Settings,
    ZoneSnapshot,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Deserialize)]
struct AddPeerRequest {
    address: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoverRequest {
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RegisterServiceRequest {
    name: String,
    /// Kept as a string; unknown values map to `InvalidServiceType`.
    #[serde(rename = "type")]
    service_type: String,
    port: u16,
    #[serde(default)]
    shared: bool,
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    short_path: String,
    target: String,
    kind: RegistryKind,
    cache_ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    peer_id: String,
    success: bool,
}

#[derive(Debug, Deserialize)]
struct AddBackupTargetRequest {
    peer_id: String,
    schedule: Option<ScheduleSpec>,
    #[serde(default = "default_retention")]
    retention: u32,
}

fn default_retention() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct RunBackupRequest {
    scopes: Vec<BackupScope>,
    #[serde(default)]
    targets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    from_peer_id: String,
    confirm: String,
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    kind: CommandKind,
    arg: Option<String>,
    peer_ids: Option<Vec<String>>,
}

// ============================================================================
// Router
// ============================================================================

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Peers
        .route("/peers", get(list_peers_handler).post(add_peer_handler))
        .route("/peers/:id", get(get_peer_handler).delete(remove_peer_handler))
        .route("/peers/discover", post(discover_handler))
        // Services
        .route("/services", get(list_services_handler).post(register_service_handler))
        .route("/services/mesh", get(list_mesh_services_handler))
        // Registry
        .route("/registry", get(list_registry_handler).post(publish_handler))
        .route("/registry/sync", post(registry_sync_handler))
        .route("/registry/flush", post(flush_cache_handler))
        .route("/registry/resolve/*path", get(resolve_handler))
        .route("/registry/entries/*path", axum::routing::delete(unpublish_handler))
        // DNS
        .route("/dns/zone", get(zone_handler))
        .route("/dns/regenerate", post(regenerate_handler))
        .route("/dns/sync", post(zone_sync_handler))
        // Load balancer
        .route(
            "/lb/:service/config",
            get(lb_config_handler).put(lb_set_config_handler),
        )
        .route("/lb/:service/endpoints", get(lb_endpoints_handler))
        .route("/lb/:service/acquire", post(lb_acquire_handler))
        .route("/lb/:service/release", post(lb_release_handler))
        // Backup
        .route(
            "/backup/targets",
            get(list_backup_targets_handler).post(add_backup_target_handler),
        )
        .route(
            "/backup/targets/:peer_id",
            axum::routing::delete(remove_backup_target_handler),
        )
        .route("/backup/run", post(run_backup_handler))
        .route("/backup/restore", post(restore_handler))
        // Broadcast
        .route("/broadcast", post(broadcast_handler))
        // Settings
        .route("/settings", get(get_settings_handler).put(put_settings_handler))
        // Peer protocol
        .route("/mesh/ping", get(mesh_ping_handler))
        .route("/mesh/registry-snapshot", get(mesh_registry_snapshot_handler))
        .route("/mesh/zone-snapshot", get(mesh_zone_snapshot_handler))
        .route("/mesh/zone", post(mesh_zone_push_handler))
        .route("/mesh/backup", post(mesh_backup_handler))
        .route("/mesh/backup/:node_id", get(mesh_backup_fetch_handler))
        .route("/mesh/command", post(mesh_command_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

/// Serve the API until the task is dropped.
pub async fn serve(coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    let listen = coordinator.config.http_listen.clone();
    let app = router(coordinator);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen, "HTTP API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Error mapping
// ============================================================================

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound { .. } | Error::NoBackupAvailable { .. } => StatusCode::NOT_FOUND,
        Error::DuplicatePeer { .. } | Error::PathConflict { .. } | Error::ZoneConflict { .. } => {
            StatusCode::CONFLICT
        }
        Error::InvalidConfig(_)
        | Error::InvalidServiceType(_)
        | Error::RestoreNotConfirmed(_) => StatusCode::BAD_REQUEST,
        Error::PeerUnreachable { .. } | Error::Timeout { .. } | Error::PeerRemoved { .. } => {
            StatusCode::BAD_GATEWAY
        }
        Error::NoHealthyEndpoint { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn json_or_error<T: serde::Serialize>(result: meshhub_common::Result<T>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(err),
    }
}

// ============================================================================
// Health and peers
// ============================================================================

async fn health_handler(State(c): State<Arc<Coordinator>>) -> Response {
    json_or_error(c.health_summary().await)
}

async fn list_peers_handler(State(c): State<Arc<Coordinator>>) -> Response {
    Json(c.membership.list()).into_response()
}

async fn get_peer_handler(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Response {
    match c.membership.get(&id) {
        Some(peer) => Json(peer).into_response(),
        None => error_response(Error::not_found("peer", id)),
    }
}

async fn add_peer_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<AddPeerRequest>,
) -> Response {
    match c.membership.add_peer(&req.address, req.name).await {
        Ok(peer) => (StatusCode::CREATED, Json(peer)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn remove_peer_handler(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Response {
    match c.membership.remove_peer(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn discover_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<DiscoverRequest>,
) -> Response {
    let window = std::time::Duration::from_secs(
        req.timeout_seconds
            .unwrap_or(c.config.fanout.discovery_timeout_seconds)
            .clamp(1, 30),
    );
    match discovery::discover(c.config.discovery_port, window, c.membership.local()).await {
        Ok(found) => json_or_error(c.membership.merge_discovered(&found)),
        Err(err) => error_response(err),
    }
}

// ============================================================================
// Services
// ============================================================================

async fn list_services_handler(State(c): State<Arc<Coordinator>>) -> Response {
    json_or_error(c.registry.list_services())
}

async fn list_mesh_services_handler(State(c): State<Arc<Coordinator>>) -> Response {
    json_or_error(c.registry.list_mesh_services())
}

async fn register_service_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<RegisterServiceRequest>,
) -> Response {
    let service_type: ServiceType = match req.service_type.parse() {
        Ok(t) => t,
        Err(e) => return error_response(Error::InvalidServiceType(e)),
    };
    let record = ServiceRecord {
        name: req.name,
        service_type,
        owner_peer_id: c.membership.local().id.clone(),
        port: req.port,
        runtime_status: RuntimeStatus::Online,
        shared: req.shared,
    };
    match c.registry.upsert_service(&record).await {
        Ok(()) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => error_response(err),
    }
}

// ============================================================================
// Registry
// ============================================================================

async fn list_registry_handler(State(c): State<Arc<Coordinator>>) -> Response {
    Json(c.registry.list().await).into_response()
}

async fn publish_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<PublishRequest>,
) -> Response {
    match c
        .registry
        .publish(&req.short_path, &req.target, req.kind, req.cache_ttl)
        .await
    {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn unpublish_handler(
    State(c): State<Arc<Coordinator>>,
    Path(path): Path<String>,
) -> Response {
    match c.registry.unpublish(&path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn resolve_handler(
    State(c): State<Arc<Coordinator>>,
    Path(path): Path<String>,
) -> Response {
    json_or_error(c.registry.resolve(&path).await)
}

async fn registry_sync_handler(State(c): State<Arc<Coordinator>>) -> Response {
    json_or_error(c.registry.sync_with_peers().await)
}

async fn flush_cache_handler(State(c): State<Arc<Coordinator>>) -> Response {
    match c.registry.flush_cache().await {
        Ok(count) => Json(serde_json::json!({ "flushed": count })).into_response(),
        Err(err) => error_response(err),
    }
}

// ============================================================================
// DNS
// ============================================================================

async fn zone_handler(State(c): State<Arc<Coordinator>>) -> Response {
    Json(c.dns.zone().await).into_response()
}

async fn regenerate_handler(State(c): State<Arc<Coordinator>>) -> Response {
    let entries = c.registry.list().await;
    match c.dns.regenerate(&entries).await {
        Ok((zone, bumped)) => {
            Json(serde_json::json!({ "zone": zone, "serial_bumped": bumped })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn zone_sync_handler(State(c): State<Arc<Coordinator>>) -> Response {
    let entries = c.registry.list().await;
    json_or_error(c.dns.sync_zones(&entries).await)
}

// ============================================================================
// Load balancer
// ============================================================================

async fn lb_config_handler(
    State(c): State<Arc<Coordinator>>,
    Path(service): Path<String>,
) -> Response {
    Json(c.lb.config(&service).await).into_response()
}

async fn lb_set_config_handler(
    State(c): State<Arc<Coordinator>>,
    Path(service): Path<String>,
    Json(config): Json<LoadBalancerConfig>,
) -> Response {
    match c.lb.set_config(&service, config).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn lb_endpoints_handler(
    State(c): State<Arc<Coordinator>>,
    Path(service): Path<String>,
) -> Response {
    json_or_error(c.lb.endpoints(&service).await)
}

async fn lb_acquire_handler(
    State(c): State<Arc<Coordinator>>,
    Path(service): Path<String>,
) -> Response {
    json_or_error(c.lb.acquire(&service).await)
}

async fn lb_release_handler(
    State(c): State<Arc<Coordinator>>,
    Path(service): Path<String>,
    Json(req): Json<ReleaseRequest>,
) -> Response {
    c.lb.release(&service, &req.peer_id, req.success).await;
    StatusCode::NO_CONTENT.into_response()
}

// ============================================================================
// Backup
// ============================================================================

async fn list_backup_targets_handler(State(c): State<Arc<Coordinator>>) -> Response {
    match c.backup.list_targets() {
        Ok(targets) => {
            let with_tokens: Vec<serde_json::Value> = targets
                .into_iter()
                .map(|t| {
                    let token =
                        crate::backup::BackupCoordinator::restore_token(&t.peer_id);
                    serde_json::json!({
                        "target": t,
                        "restore_token": token,
                    })
                })
                .collect();
            Json(with_tokens).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn add_backup_target_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<AddBackupTargetRequest>,
) -> Response {
    match c.backup.add_target(&req.peer_id, req.schedule, req.retention) {
        Ok(target) => (StatusCode::CREATED, Json(target)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn remove_backup_target_handler(
    State(c): State<Arc<Coordinator>>,
    Path(peer_id): Path<String>,
) -> Response {
    match c.backup.remove_target(&peer_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn run_backup_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<RunBackupRequest>,
) -> Response {
    if req.scopes.is_empty() {
        return error_response(Error::InvalidConfig(
            "at least one backup scope is required".to_string(),
        ));
    }
    json_or_error(c.backup.run_backup(req.scopes, req.targets).await)
}

async fn restore_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<RestoreRequest>,
) -> Response {
    json_or_error(c.backup.restore(&req.from_peer_id, &req.confirm).await)
}

// ============================================================================
// Broadcast and settings
// ============================================================================

async fn broadcast_handler(
    State(c): State<Arc<Coordinator>>,
    Json(req): Json<BroadcastRequest>,
) -> Response {
    let command = BroadcastCommand {
        kind: req.kind,
        arg: req.arg,
    };
    json_or_error(c.broadcaster.broadcast(command, req.peer_ids).await)
}

async fn get_settings_handler(State(c): State<Arc<Coordinator>>) -> Response {
    json_or_error(c.settings())
}

async fn put_settings_handler(
    State(c): State<Arc<Coordinator>>,
    Json(settings): Json<Settings>,
) -> Response {
    match c.set_settings(&settings) {
        Ok(()) => Json(settings).into_response(),
        Err(err) => error_response(err),
    }
}

// ============================================================================
// Peer protocol
// ============================================================================

async fn mesh_ping_handler(State(c): State<Arc<Coordinator>>) -> Response {
    let mut ann = c.membership.local().clone();
    if let Ok(services) = c.db.list_services_by_owner(&ann.id) {
        ann.services_count = services.len() as u32;
        ann.capabilities.clear();
        for svc in &services {
            if !ann.capabilities.contains(&svc.service_type) {
                ann.capabilities.push(svc.service_type);
            }
        }
    }
    Json(ann).into_response()
}

async fn mesh_registry_snapshot_handler(State(c): State<Arc<Coordinator>>) -> Response {
    match c.settings() {
        Ok(settings) if !settings.sharing_enabled => error_response(Error::InvalidConfig(
            "sharing is disabled on this node".to_string(),
        )),
        Ok(_) => json_or_error(c.registry.snapshot().await),
        Err(err) => error_response(err),
    }
}

async fn mesh_zone_snapshot_handler(State(c): State<Arc<Coordinator>>) -> Response {
    Json(c.dns.snapshot().await).into_response()
}

async fn mesh_zone_push_handler(
    State(c): State<Arc<Coordinator>>,
    Json(snapshot): Json<ZoneSnapshot>,
) -> Response {
    match c.dns.accept_remote(&snapshot.origin, &snapshot).await {
        Ok(accepted) => {
            let entries = c.registry.list().await;
            if let Err(err) = c.dns.regenerate(&entries).await {
                return error_response(err);
            }
            Json(serde_json::json!({ "accepted": accepted })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn mesh_backup_handler(
    State(c): State<Arc<Coordinator>>,
    Json(archive): Json<BackupArchive>,
) -> Response {
    match c.backup.receive(&archive) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn mesh_backup_fetch_handler(
    State(c): State<Arc<Coordinator>>,
    Path(node_id): Path<String>,
) -> Response {
    json_or_error(c.backup.serve(&node_id))
}

async fn mesh_command_handler(
    State(c): State<Arc<Coordinator>>,
    Json(command): Json<BroadcastCommand>,
) -> Response {
    info!(kind = %command.kind, arg = ?command.arg, "command received");
    match command.kind {
        CommandKind::Sync => {
            let c = c.clone();
            tokio::spawn(async move {
                if let Err(e) = c.registry.sync_with_peers().await {
                    warn!(error = %e, "commanded registry sync failed");
                }
                let entries = c.registry.list().await;
                if let Err(e) = c.dns.sync_zones(&entries).await {
                    warn!(error = %e, "commanded zone sync failed");
                }
            });
        }
        CommandKind::Backup => {
            let c = c.clone();
            tokio::spawn(async move {
                if let Err(e) = c
                    .backup
                    .run_backup(vec![BackupScope::Config, BackupScope::Data], None)
                    .await
                {
                    warn!(error = %e, "commanded backup failed");
                }
            });
        }
        // Restart/update of host services is outside the coordinator's
        // remit; acknowledge so the sender sees delivery.
        CommandKind::Restart | CommandKind::Update | CommandKind::Custom => {}
    }
    StatusCode::ACCEPTED.into_response()
}
