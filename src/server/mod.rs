use crate::model::{DesiredLightState, SaberState};
use crate::protocol::AuxCommand;
use crate::transport::SessionGates;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Server-side handle to one saber's control channels.
pub struct DeviceHandle {
    pub name: String,
    pub state_rx: watch::Receiver<SaberState>,
    pub desired_tx: watch::Sender<DesiredLightState>,
    pub aux_tx: mpsc::Sender<AuxCommand>,
    pub wled_active: Arc<AtomicBool>,
    pub gates: SessionGates,
}

struct ServerState {
    token: String,
    devices: Vec<DeviceHandle>,
}

impl ServerState {
    fn device(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.iter().find(|d| d.name == name)
    }
}

pub async fn start(
    addr: SocketAddr,
    token: String,
    devices: Vec<DeviceHandle>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(ServerState { token, devices });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:name/state", get(device_state))
        .route("/api/devices/:name/light", post(set_light))
        .route("/api/devices/:name/sync", put(set_sync_mode))
        .route("/api/devices/:name/command", post(send_command))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

#[derive(Serialize)]
struct DeviceSummary {
    name: String,
    authorized: bool,
    wled_active: bool,
    state: SaberState,
}

fn summarize(device: &DeviceHandle) -> DeviceSummary {
    DeviceSummary {
        name: device.name.clone(),
        authorized: device.gates.is_authorized(),
        wled_active: device.wled_active.load(Ordering::SeqCst),
        state: device.state_rx.borrow().clone(),
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_devices(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let list: Vec<DeviceSummary> = state.devices.iter().map(summarize).collect();
    Json(list).into_response()
}

async fn device_state(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.device(&name) {
        Some(device) => Json(summarize(device)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn set_light(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(desired): Json<DesiredLightState>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.device(&name) {
        Some(device) => {
            device.desired_tx.send_replace(desired);
            StatusCode::ACCEPTED.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct SyncModeRequest {
    active: bool,
}

async fn set_sync_mode(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(request): Json<SyncModeRequest>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.device(&name) {
        Some(device) => {
            device.wled_active.store(request.active, Ordering::SeqCst);
            tracing::info!(
                device = %device.name,
                "wled sync {}",
                if request.active { "enabled" } else { "disabled" }
            );
            Json(request).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn send_command(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(command): Json<AuxCommand>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.device(&name) {
        Some(device) => match device.aux_tx.try_send(command) {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(name) = query.0.get("device").cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(device) = state.device(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let rx = device.state_rx.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, mut rx: watch::Receiver<SaberState>) {
    loop {
        let payload = {
            let state = rx.borrow_and_update();
            serde_json::to_string(&*state).unwrap_or_default()
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

// Accept the token either as a bearer header (API clients) or as a query
// parameter (browser access).
fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            if bearer == token {
                return true;
            }
        }
    }
    query.get("token").map(String::as_str) == Some(token)
}
