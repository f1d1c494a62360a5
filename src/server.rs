//! ==============================================================================
//! server.rs - http surface and push-channel sessions
//! ==============================================================================
//!
//! purpose:
//!     everything that runs in the request-serving context:
//!     - GET /ws/updates           push channel (subprotocol handshake)
//!     - GET /health               liveness
//!     - GET /system/status        broker link, storage, live connection count
//!     - GET /api/devices          known devices
//!     - GET /api/devices/{dev}    device id + its latest reading
//!     - GET /api/readings/{dev}   recent readings, newest first (?limit=)
//!     - GET /api/readings/latest/{dev}
//!
//! push session lifecycle:
//!     upgrade request ──credential ok──> accept (echo subprotocol) ──> admit
//!                     └─credential bad─> accept (echo first offer), send close 1008, done
//!
//!     an admitted session runs two halves until either ends:
//!     - writer: drains the connection outbox into the socket (bounded send)
//!     - reader: consumes client frames until close / error
//!     then the connection is unregistered (idempotent with broadcast pruning).
//!
//! relationships:
//!     - uses: push.rs (registry), store.rs (read queries), ingest.rs (LinkStatus)
//!     - used by: main.rs
//!
//! ==============================================================================

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::ws::{close_code, CloseFrame, Message, WebSocket},
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, warn};

use crate::error::HandshakeRejected;
use crate::ingest::LinkStatus;
use crate::push::{offered_protocols, ConnectionRegistry, Frame, Grant};
use crate::store::ReadingStore;

const DEFAULT_READING_LIMIT: usize = 100;
const MAX_READING_LIMIT: usize = 10_000;
const NO_READINGS: &str = "No readings for this device";

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn ReadingStore>,
    pub link: LinkStatus,
    pub outbox_capacity: usize,
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/ws/updates", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/system/status", get(status_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/:dev_eui", get(device_info_handler))
        .route("/api/readings/latest/:dev_eui", get(latest_handler))
        .route("/api/readings/:dev_eui", get(recent_handler))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

// ==============================================================================
// push channel
// ==============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let offered = offered_protocols(
        headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok()),
    );

    match state.registry.authenticate(offered.iter().copied()) {
        Ok(grant) => ws
            .protocols([grant.protocol.clone()])
            .on_upgrade(move |socket| run_session(socket, state, grant))
            .into_response(),
        Err(rejected) => {
            warn!("push handshake rejected: {}", rejected);
            // browsers abort an upgrade that selects none of the offered
            // protocols, and would never see the close code
            let echo = offered.first().map(|p| p.to_string());
            ws.protocols(echo)
                .on_upgrade(move |socket| reject_session(socket, rejected))
                .into_response()
        }
    }
}

async fn reject_session(mut socket: WebSocket, rejected: HandshakeRejected) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Cow::Owned(rejected.to_string()),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("close frame not delivered: {}", e);
    }
}

async fn run_session(socket: WebSocket, state: AppState, grant: Grant) {
    let (outbox, mut frames) = mpsc::channel::<Frame>(state.outbox_capacity);
    let id = state.registry.admit(grant, outbox);
    let send_timeout = state.registry.send_timeout();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let send = ws_tx.send(Message::Text(frame.to_string()));
            match tokio::time::timeout(send_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection = id, "socket send failed: {}", e);
                    break;
                }
                Err(_) => {
                    debug!(connection = id, "socket send timed out");
                    break;
                }
            }
        }
    });

    let mut reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                // viewers are receive-only; pings are answered by axum
                Ok(_) => {}
                Err(e) => {
                    debug!(connection = id, "socket read error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.registry.unregister(id);
}

// ==============================================================================
// status + read api
// ==============================================================================

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub api: &'static str,
    pub database: String,
    pub mqtt: &'static str,
    pub websocket_connections: usize,
}

async fn status_handler(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(system_status(&state))
}

pub fn system_status(state: &AppState) -> SystemStatus {
    SystemStatus {
        api: "online",
        database: match state.store.check() {
            Ok(()) => "connected".to_string(),
            Err(e) => format!("error: {}", e),
        },
        mqtt: if state.link.is_connected() {
            "connected"
        } else {
            "disconnected"
        },
        websocket_connections: state.registry.len(),
    }
}

async fn devices_handler(State(state): State<AppState>) -> Response {
    match state.store.devices() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => storage_failure(e),
    }
}

async fn device_info_handler(Path(dev_eui): Path<String>, State(state): State<AppState>) -> Response {
    match state.store.latest(&dev_eui) {
        Ok(Some(latest)) => Json(json!({"dev_eui": dev_eui, "latest": latest})).into_response(),
        Ok(None) => Json(json!({"error": NO_READINGS})).into_response(),
        Err(e) => storage_failure(e),
    }
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn recent_handler(
    Path(dev_eui): Path<String>,
    Query(params): Query<LimitParams>,
    State(state): State<AppState>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_READING_LIMIT)
        .min(MAX_READING_LIMIT);
    match state.store.recent(&dev_eui, limit) {
        Ok(readings) => Json(readings).into_response(),
        Err(e) => storage_failure(e),
    }
}

async fn latest_handler(Path(dev_eui): Path<String>, State(state): State<AppState>) -> Response {
    match state.store.latest(&dev_eui) {
        Ok(Some(reading)) => Json(reading).into_response(),
        Ok(None) => Json(json!({"error": NO_READINGS})).into_response(),
        Err(e) => storage_failure(e),
    }
}

fn storage_failure(e: crate::error::StorageError) -> Response {
    error!("read query failed: {}", e);
    (
        axum::http::StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::Authenticator;
    use crate::store::SqliteStore;
    use crate::{Calibration, Reading, TelemetryParser};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::handshake::client::Response as UpgradeResponse;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn state() -> AppState {
        AppState {
            registry: Arc::new(ConnectionRegistry::new(
                Authenticator::SharedSecret("k".into()),
                Duration::from_millis(100),
            )),
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            link: LinkStatus::default(),
            outbox_capacity: 8,
        }
    }

    fn reading(raw: u64) -> Reading {
        let payload = json!({"devEUI": "f0a1", "raw_value": raw, "timestamp": 1_764_288_000});
        TelemetryParser::new(Calibration::default())
            .parse(payload.to_string().as_bytes())
            .unwrap()
    }

    async fn serve(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state, &[]);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn connect(addr: SocketAddr, protocol: Option<&str>) -> (Client, UpgradeResponse) {
        let mut request = format!("ws://{}/ws/updates", addr).into_client_request().unwrap();
        if let Some(protocol) = protocol {
            request
                .headers_mut()
                .insert("sec-websocket-protocol", protocol.parse().unwrap());
        }
        tokio_tungstenite::connect_async(request).await.unwrap()
    }

    async fn wait_for_connections(registry: &ConnectionRegistry, expected: usize) {
        for _ in 0..200 {
            if registry.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} live connections, have {}", expected, registry.len());
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_reports_link_and_connection_count() {
        let state = state();
        let (tx, _rx) = mpsc::channel(1);
        state.registry.register(["k"], tx).unwrap();

        let status = system_status(&state);
        assert_eq!(status.api, "online");
        assert_eq!(status.database, "connected");
        assert_eq!(status.mqtt, "disconnected");
        assert_eq!(status.websocket_connections, 1);
    }

    #[test]
    fn router_builds_with_and_without_origins() {
        let _ = router(state(), &[]);
        let _ = router(
            state(),
            &["http://localhost:5173".to_string(), "bad\norigin".to_string()],
        );
    }

    #[tokio::test]
    async fn wrong_credential_gets_policy_close_and_is_never_admitted() {
        let state = state();
        let addr = serve(state.clone()).await;

        for offered in [Some("not-the-key"), None] {
            let (mut client, _) = connect(addr, offered).await;
            match client.next().await {
                Some(Ok(ClientMessage::Close(Some(frame)))) => {
                    assert_eq!(frame.code, CloseCode::Policy, "offered {offered:?}")
                }
                other => panic!("expected a policy close for {offered:?}, got {other:?}"),
            }
            assert_eq!(state.registry.len(), 0);
        }
    }

    #[tokio::test]
    async fn accepted_viewer_gets_protocol_echo_and_readings_until_it_leaves() {
        let state = state();
        let addr = serve(state.clone()).await;

        let (mut client, response) = connect(addr, Some("k")).await;
        let echoed = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok());
        assert_eq!(echoed, Some("k"));
        wait_for_connections(&state.registry, 1).await;

        let report = state.registry.broadcast(&reading(11656)).await;
        assert_eq!(report.delivered, 1);
        match client.next().await {
            Some(Ok(ClientMessage::Text(text))) => {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(frame["dev_eui"], "f0a1");
                assert_eq!(frame["raw_value"], 11656);
            }
            other => panic!("expected a reading frame, got {other:?}"),
        }

        drop(client);
        wait_for_connections(&state.registry, 0).await;
    }

    #[tokio::test]
    async fn device_info_carries_latest_reading() {
        let state = state();
        state.store.store_reading(&reading(11000)).unwrap();
        state.store.store_reading(&reading(11656)).unwrap();

        let found = device_info_handler(Path("f0a1".to_string()), State(state.clone())).await;
        let body = json_body(found).await;
        assert_eq!(body["dev_eui"], "f0a1");
        assert_eq!(body["latest"]["raw_value"], 11656);

        let missing = device_info_handler(Path("ffff".to_string()), State(state)).await;
        assert_eq!(json_body(missing).await, json!({"error": NO_READINGS}));
    }
}
