//! Host node binary: REST + WebSocket API, automation engine, and the
//! link client mirroring the radio node's state.

use automation_engine::executor::ActionExecutor;
use automation_engine::model::{ActionSpec, AutomationSpec};
use automation_engine::store::AutomationStore;
use automation_engine::RulesEngine;
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use gateway_core::classify;
use gateway_core::error::ErrorKind;
use gateway_core::event::EventBus;
use gateway_core::state::StateValue;
use gateway_core::uid::DeviceUid;
use link_protocol::message::{CmdId, CmdRequest};
use link_protocol::transport::{LinkEvent, LinkTransport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod sync;
mod websocket;

use commands::LinkPort;
use sync::{apply_event, record_to_event, HostStores, SnapshotApplier};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub stores: HostStores,
    pub link: Option<Arc<LinkTransport>>,
    pub automations: Arc<AutomationStore>,
    pub executor: Option<Arc<ActionExecutor<LinkPort<LinkTransport>>>>,
}

/// API response envelope
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgs | ErrorKind::FormatError => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotReady | ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::NoMem | ErrorKind::CrcError | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Device as presented over the API
#[derive(Serialize)]
struct DeviceView {
    uid: String,
    name: String,
    short_addr: u16,
    last_seen_ms: u64,
    has_onoff: bool,
    has_button: bool,
    endpoints: Vec<EndpointView>,
    state: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct EndpointView {
    endpoint: u8,
    profile_id: u16,
    device_id: u16,
    kind: &'static str,
    in_clusters: Vec<u16>,
    out_clusters: Vec<u16>,
    accepts: Vec<&'static str>,
    emits: Vec<&'static str>,
    reports: Vec<&'static str>,
}

fn state_json(value: &StateValue) -> serde_json::Value {
    match value {
        StateValue::Bool(b) => serde_json::json!(b),
        StateValue::F32(f) => serde_json::json!(f),
        StateValue::U32(v) => serde_json::json!(v),
        StateValue::U64(v) => serde_json::json!(v),
    }
}

fn device_view(state: &AppState, device: &gateway_core::device::DeviceRecord) -> DeviceView {
    let model_eps = state.stores.model.list_endpoints(device.uid);
    let records: Vec<_> = if model_eps.is_empty() {
        device.endpoints.clone()
    } else {
        model_eps.into_iter().map(|e| e.record).collect()
    };

    let endpoints = records
        .iter()
        .map(|record| EndpointView {
            endpoint: record.endpoint,
            profile_id: record.profile_id,
            device_id: record.device_id,
            kind: classify::classify(record).as_str(),
            in_clusters: record.in_clusters.clone(),
            out_clusters: record.out_clusters.clone(),
            accepts: classify::accepts(record),
            emits: classify::emits(record),
            reports: classify::reports(record),
        })
        .collect();

    let mut state_map = serde_json::Map::new();
    for (key, entry) in state.stores.states.list(device.uid) {
        state_map.insert(key, state_json(&entry.value));
    }

    DeviceView {
        uid: device.uid.to_string(),
        name: device.name.clone(),
        short_addr: device.short_addr,
        last_seen_ms: device.last_seen_ms,
        has_onoff: device.has_onoff,
        has_button: device.has_button,
        endpoints,
        state: state_map,
    }
}

#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    link_connected: bool,
    device_count: usize,
    automation_count: usize,
}

async fn system_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(SystemInfo {
        name: "zigbee-gateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        link_connected: state.link.is_some(),
        device_count: state.stores.registry.len(),
        automation_count: state.automations.len(),
    }))
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    let devices: Vec<DeviceView> = state
        .stores
        .registry
        .list()
        .iter()
        .map(|d| device_view(&state, d))
        .collect();
    Json(ApiResponse::success(devices))
}

async fn get_device(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    let Ok(uid) = uid.parse::<DeviceUid>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("bad device uid")),
        );
    };
    match state.stores.registry.get(uid) {
        Some(device) => (
            StatusCode::OK,
            Json(ApiResponse::success(device_view(&state, &device))),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("device not found")),
        ),
    }
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
}

async fn rename_device(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(req): Json<RenameRequest>,
) -> impl IntoResponse {
    let Ok(uid) = uid.parse::<DeviceUid>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("bad device uid")),
        );
    };
    match state.stores.registry.set_name(uid, &req.name) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(req.name))),
        Err(e) => (error_status(e.kind), Json(ApiResponse::error(e.message))),
    }
}

async fn device_action(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(mut action): Json<ActionSpec>,
) -> impl IntoResponse {
    let Some(executor) = &state.executor else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("link not available")),
        );
    };
    if action.device_uid.is_none() && action.group_id.is_none() {
        action.device_uid = Some(uid);
    }
    match executor.execute_portable(&action).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success("accepted"))),
        Err(e) => (error_status(e.kind), Json(ApiResponse::error(e.message))),
    }
}

#[derive(Deserialize)]
struct PermitJoinRequest {
    #[serde(default)]
    duration: u32,
}

async fn permit_join(
    State(state): State<AppState>,
    Json(req): Json<PermitJoinRequest>,
) -> impl IntoResponse {
    let Some(link) = &state.link else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("link not available")),
        );
    };
    let mut cmd = CmdRequest::new(link.alloc_req_id(), CmdId::PermitJoin);
    cmd.param0 = req.duration;
    match link.request_ok(cmd).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "duration": req.duration
            }))),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn sync_now(State(state): State<AppState>) -> impl IntoResponse {
    let Some(link) = &state.link else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("link not available")),
        );
    };
    match link.request_snapshot().await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success("snapshot requested"))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn list_automations(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.automations.list_meta()))
}

async fn put_automation(
    State(state): State<AppState>,
    Json(spec): Json<AutomationSpec>,
) -> impl IntoResponse {
    match state.automations.put(&spec).await {
        Ok(id) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({ "id": id }))),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn get_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let meta = state
        .automations
        .list_meta()
        .into_iter()
        .find(|m| m.id == id);
    match meta {
        Some(meta) => (StatusCode::OK, Json(ApiResponse::success(meta))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("automation not found")),
        ),
    }
}

async fn delete_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.automations.remove(&id).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(id))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

#[derive(Deserialize)]
struct EnableRequest {
    enabled: bool,
}

async fn enable_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EnableRequest>,
) -> impl IntoResponse {
    match state.automations.set_enabled(&id, req.enabled).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(req.enabled))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn ws_upgrade(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/system", get(system_info))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:uid", get(get_device))
        .route("/api/devices/:uid/name", post(rename_device))
        .route("/api/devices/:uid/actions", post(device_action))
        .route("/api/network/permit_join", post(permit_join))
        .route("/api/sync", post(sync_now))
        .route("/api/automations", get(list_automations).post(put_automation))
        .route(
            "/api/automations/:id",
            get(get_automation).delete(delete_automation),
        )
        .route("/api/automations/:id/enable", post(enable_automation))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Consume link events: apply to the mirror, republish on the bus.
fn spawn_link_loop(stores: HostStores, link: Arc<LinkTransport>) {
    let applier = SnapshotApplier::new(stores.clone());
    let mut rx = link.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(LinkEvent::Event(record)) => {
                    apply_event(&stores, &record);
                    stores.bus.publish(record_to_event(&record));
                }
                Ok(LinkEvent::Snapshot(record)) => applier.apply(&record),
                Ok(LinkEvent::HelloAck { seq }) => {
                    tracing::info!("link session opened (seq={})", seq);
                }
                Ok(LinkEvent::Pong { seq }) => tracing::trace!("pong seq={}", seq),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("link event loop lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_host=info,link_protocol=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("GW_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let automations_path = std::path::PathBuf::from(&data_dir).join("automations.gwar");

    let bus = Arc::new(EventBus::new());
    let stores = HostStores::new(bus.clone());
    let automations = Arc::new(AutomationStore::open(automations_path, bus.clone()).await);

    // Connect the link when a serial port is configured.
    let link = match std::env::var("GW_LINK_PORT") {
        Ok(path) => match LinkTransport::connect(&path).await {
            Ok(link) => Some(Arc::new(link)),
            Err(e) => {
                tracing::error!("link connect failed: {}", e);
                None
            }
        },
        Err(_) => {
            tracing::warn!("GW_LINK_PORT not set, running without radio link");
            None
        }
    };

    let executor = link.as_ref().map(|link| {
        Arc::new(ActionExecutor::new(Arc::new(LinkPort::new(link.clone()))))
    });

    if let Some(link) = &link {
        spawn_link_loop(stores.clone(), link.clone());

        // Session open, periodic liveness, initial full sync.
        let _ = link.send_hello().await;
        let ping_link = link.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(15)).await;
                if ping_link.send_ping().await.is_err() {
                    break;
                }
            }
        });
        if let Err(e) = link.request_snapshot().await {
            tracing::warn!("initial snapshot request failed: {}", e);
        }

        // The rules engine runs on the host, firing actions over the link.
        let port = Arc::new(LinkPort::new(link.clone()));
        let engine = RulesEngine::new(
            automations.clone(),
            stores.states.clone(),
            bus.clone(),
            port,
        );
        engine.start();
    }

    let state = AppState {
        stores,
        link,
        automations,
        executor,
    };

    let addr = std::env::var("GW_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP API listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
