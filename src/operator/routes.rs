//! REST + WebSocket routes for the telemetry middleware operator API.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use xxhash_rust::xxh64::xxh64;

use crate::broadcast_push::{ws_handler, PushState};
use crate::bus::EventBus;
use crate::cache::{ModuleState, StateCache};
use crate::common::AtomicCounters;
use crate::config::Config;
use crate::types::{CommandRequest, DeviceType};

use super::{ApiResponse, CommandSubmission, ErrorResponse};

/// Wraps `axum::Json` so that a malformed or incomplete request body
/// produces the crate-wide `{error:string}` shape instead of axum's
/// default plain-text rejection body.
struct ValidatedJson<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                Err((StatusCode::BAD_REQUEST, Json(ErrorResponse::new(rejection.body_text()))))
            }
        }
    }
}

/// Application state shared across handlers.
pub struct AppState {
    pub cache: Arc<StateCache>,
    pub bus: EventBus,
    pub config: Config,
    pub started_at: Instant,
    pub mqtt_connected: std::sync::atomic::AtomicBool,
    /// Ingress adapter's received/processed/dropped counters, read by
    /// `/api/health`; defaults to a fresh zeroed set until the
    /// composition root wires in the live ingress adapter's handle.
    pub ingress_counters: Arc<AtomicCounters>,
}

impl AppState {
    pub fn new(cache: Arc<StateCache>, bus: EventBus, config: Config) -> Self {
        Self {
            cache,
            bus,
            config,
            started_at: Instant::now(),
            mqtt_connected: std::sync::atomic::AtomicBool::new(false),
            ingress_counters: Arc::new(AtomicCounters::new()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime: u64,
    pub db: &'static str,
    pub mqtt: &'static str,
    pub memory: u64,
    pub ingress_messages_received: u64,
    pub ingress_messages_dropped: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTopology {
    pub module_index: u32,
    pub module_id: Option<String>,
    pub u_total: Option<u32>,
    pub fw_ver: Option<String>,
    pub online: bool,
    pub last_seen_hb: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTopology {
    pub device_id: String,
    pub device_type: Option<DeviceType>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub fw_ver: Option<String>,
    pub mask: Option<String>,
    #[serde(rename = "gwIp")]
    pub gateway: Option<String>,
    pub online: bool,
    pub last_seen_info: Option<chrono::DateTime<chrono::Utc>>,
    pub modules: Vec<ModuleTopology>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandAccepted {
    pub status: &'static str,
    pub command_id: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, get_config, get_topology, get_module, submit_command, get_history),
    components(schemas(
        HealthResponse,
        DeviceTopology,
        ModuleTopology,
        CommandAccepted,
        ApiResponse,
        ErrorResponse,
        CommandSubmission,
    )),
    tags(
        (name = "Live State", description = "Health, config and live device/module snapshots"),
        (name = "Commands", description = "Device command submission"),
        (name = "History", description = "Historical query surface"),
    ),
    info(
        title = "IoT Telemetry Middleware API",
        version = "1.0.0",
        description = "REST API for device topology, live state, command submission, and history"
    )
)]
struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let push_state = PushState { bus: state.bus.clone() };

    let api_routes = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/config", get(get_config))
        .route("/api/live/topology", get(get_topology))
        .route("/api/live/devices/:device_id/modules/:module_index", get(get_module))
        .route("/api/commands", post(submit_command))
        .route("/api/history/:device_id", get(get_history))
        .with_state(state);

    let ws_routes = Router::new().route("/ws", get(ws_handler)).with_state(push_state);

    Router::new()
        .merge(api_routes)
        .merge(ws_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
}

/// Get aggregate liveness and dependency health
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "Live State",
    responses((status = 200, description = "Health snapshot", body = HealthResponse))
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db = if state.config.modules.storage.enabled { "connected" } else { "disconnected" };
    let mqtt = if state.mqtt_connected.load(std::sync::atomic::Ordering::Relaxed) {
        "connected"
    } else {
        "disconnected"
    };

    let counters = state.ingress_counters.snapshot();
    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        db,
        mqtt,
        memory: memory_usage_bytes(),
        ingress_messages_received: counters.received,
        ingress_messages_dropped: counters.dropped,
    })
}

fn memory_usage_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).map(|s| s.to_string()))
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

/// Get the effective configuration with secrets redacted
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "Live State",
    responses((status = 200, description = "Redacted configuration", body = Object))
)]
async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.config.redacted())
}

/// List every known device's metadata and module topology
#[utoipa::path(
    get,
    path = "/api/live/topology",
    tag = "Live State",
    responses((status = 200, description = "Device topology", body = [DeviceTopology]))
)]
async fn get_topology(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceTopology>> {
    let device_ids = state.cache.list_device_ids();
    let topology = device_ids
        .into_iter()
        .filter_map(|device_id| {
            let device = state.cache.snapshot_device(&device_id)?;
            let modules = state
                .cache
                .list_modules(&device_id)
                .into_iter()
                .map(|(module_index, module)| ModuleTopology {
                    module_index,
                    module_id: module.module_id,
                    u_total: module.u_total,
                    fw_ver: module.fw_ver,
                    online: module.online,
                    last_seen_hb: module.last_seen_heartbeat,
                })
                .collect();
            Some(DeviceTopology {
                device_id,
                device_type: device.device_type,
                ip: device.ip,
                mac: device.mac,
                fw_ver: device.fw_ver,
                mask: device.mask,
                gateway: device.gateway,
                online: device.online,
                last_seen_info: device.last_seen_info,
                modules,
            })
        })
        .collect();

    Json(topology)
}

/// Get full state for a single module
#[utoipa::path(
    get,
    path = "/api/live/devices/{device_id}/modules/{module_index}",
    tag = "Live State",
    params(("device_id" = String, Path), ("module_index" = u32, Path)),
    responses(
        (status = 200, description = "Module state", body = Object),
        (status = 404, description = "Module not found in cache")
    )
)]
async fn get_module(
    State(state): State<Arc<AppState>>,
    Path((device_id, module_index)): Path<(String, u32)>,
) -> Result<Json<ModuleState>, StatusCode> {
    state
        .cache
        .snapshot_module(&device_id, module_index)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Submit a command intent for a device
#[utoipa::path(
    post,
    path = "/api/commands",
    tag = "Commands",
    request_body = CommandSubmission,
    responses(
        (status = 202, description = "Command accepted for translation/dispatch", body = CommandAccepted),
        (status = 400, description = "Malformed or missing required field", body = ErrorResponse)
    )
)]
async fn submit_command(
    State(state): State<Arc<AppState>>,
    ValidatedJson(submission): ValidatedJson<CommandSubmission>,
) -> (StatusCode, Json<CommandAccepted>) {
    let command_id = submission.command_id.clone().unwrap_or_else(|| {
        let seed = format!(
            "{}{:?}{:?}",
            submission.device_id,
            submission.message_type,
            std::time::SystemTime::now()
        );
        format!("cmd_{:x}", xxh64(seed.as_bytes(), 0))
    });

    let cmd = CommandRequest {
        device_id: submission.device_id,
        device_type: submission.device_type,
        message_type: submission.message_type,
        payload: submission.payload,
        command_id: Some(command_id.clone()),
    };
    state.bus.publish_command(cmd);

    (StatusCode::ACCEPTED, Json(CommandAccepted { status: "sent", command_id }))
}

/// Historical query surface — returns 501 while the storage component is
/// disabled; no query execution path exists independent of it.
#[utoipa::path(
    get,
    path = "/api/history/{device_id}",
    tag = "History",
    params(("device_id" = String, Path)),
    responses((status = 501, description = "Storage component disabled or history querying not implemented"))
)]
async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(_device_id): Path<String>,
) -> StatusCode {
    if !state.config.modules.storage.enabled {
        return StatusCode::NOT_IMPLEMENTED;
    }
    StatusCode::NOT_IMPLEMENTED
}
