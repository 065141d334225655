use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use lanbeam_shared::constants::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION, REGISTRY_WS_PATH};
use lanbeam_shared::protocol::{ClientMessage, ServerMessage};
use lanbeam_shared::types::{DeviceIdentity, SessionKey};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::{self, RegistryEvent, RegistryNotification};

#[derive(Clone)]
pub struct AppState {
    pub registry: mpsc::Sender<RegistryEvent>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(REGISTRY_WS_PATH, get(presence_socket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    host: DeviceIdentity,
    sessions: usize,
    devices: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Result<Json<ServerInfoResponse>, ServerError> {
    let (tx, rx) = oneshot::channel();
    state
        .registry
        .send(RegistryEvent::Info(tx))
        .await
        .map_err(|_| ServerError::RegistryUnavailable)?;
    let info = rx.await.map_err(|_| ServerError::RegistryUnavailable)?;

    Ok(Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        host: info.host,
        sessions: info.sessions,
        devices: info.devices,
    }))
}

async fn presence_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_session(socket, state.registry))
}

/// Pump one presence session between its socket and the registry task.
async fn handle_session(socket: WebSocket, registry: mpsc::Sender<RegistryEvent>) {
    let session_key = SessionKey::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(256);

    if registry
        .send(RegistryEvent::Connected {
            session_key: session_key.clone(),
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        warn!("Registry stopped, refusing session");
        return;
    }

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else { break };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode presence message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                        Ok(message) => {
                            let event = RegistryEvent::Message {
                                session_key: session_key.clone(),
                                message,
                            };
                            if registry.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(session = %session_key.short(), error = %e, "Dropping malformed presence message");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = %session_key.short(), error = %e, "Presence socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = registry
        .send(RegistryEvent::Disconnected { session_key })
        .await;
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting registry server");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Start a registry inside the current process.
///
/// Binds `config.bind_addr`, spawns the registry task and the HTTP server,
/// and returns the bound address with the notification stream.
pub async fn spawn_registry(
    config: ServerConfig,
    host: DeviceIdentity,
) -> Result<(SocketAddr, mpsc::Receiver<RegistryNotification>), ServerError> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;
    let addr = listener
        .local_addr()
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    let (events, notifications) = registry::spawn(host);
    let state = AppState {
        registry: events,
        config: Arc::new(config),
    };

    tokio::spawn(async move {
        if let Err(e) = serve(listener, state).await {
            tracing::error!(error = %e, "Registry server failed");
        }
    });

    Ok((addr, notifications))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    use lanbeam_shared::types::DeviceId;

    fn host() -> DeviceIdentity {
        DeviceIdentity {
            id: DeviceId::new("host"),
            name: "registry-host".into(),
            address: "127.0.0.1".into(),
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (events, _notifications) = registry::spawn(host());
        let app = build_router(AppState {
            registry: events,
            config: Arc::new(test_config()),
        });

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_info_reports_host() {
        let (events, _notifications) = registry::spawn(host());
        let app = build_router(AppState {
            registry: events,
            config: Arc::new(test_config()),
        });

        let response = app
            .oneshot(Request::builder().uri("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["host"]["id"], "host");
        assert_eq!(json["sessions"], 0);
        assert_eq!(json["protocol"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_presence_over_websocket() {
        let (addr, mut notifications) = spawn_registry(test_config(), host()).await.unwrap();
        let url = format!("ws://{addr}{REGISTRY_WS_PATH}");

        let (mut a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        // Each session is greeted with the host identity.
        for socket in [&mut a, &mut b] {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let message = ServerMessage::from_json(text.as_str()).unwrap();
                    assert_eq!(message, ServerMessage::IdentityAnnounce(host()));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        let announce = ClientMessage::IdentityAnnounce(DeviceIdentity {
            id: DeviceId::new("a1"),
            name: "alpha".into(),
            address: "127.0.0.1".into(),
        });
        a.send(WsMessage::Text(announce.to_json().unwrap().into()))
            .await
            .unwrap();

        let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            notification,
            RegistryNotification::DeviceAnnounced(ref r) if r.id == DeviceId::new("a1")
        ));

        // b may see the host record first, depending on connect order.
        let discovered = loop {
            match tokio::time::timeout(Duration::from_secs(2), b.next()).await.unwrap() {
                Some(Ok(WsMessage::Text(text))) => {
                    if let ServerMessage::DeviceDiscovered(record) =
                        ServerMessage::from_json(text.as_str()).unwrap()
                    {
                        if record.id == DeviceId::new("a1") {
                            break record;
                        }
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        };
        assert!(discovered.session_key.is_some());

        drop(a);
        let closed = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(closed, RegistryNotification::SessionClosed(_)));
    }
}
