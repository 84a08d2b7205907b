//! HTTP and WebSocket front end
//!
//! Routes served from one listener:
//! - `GET /health` - liveness plus room and peer counts
//! - `GET /stats` - room and peer counts
//! - `POST /app.v1.AppService/:method` - unary JSON RPC
//! - `GET /ws?roomId=..&peerId=..` - a peer's realtime session

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::header::{CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

use duet_core::SignalConfig;

use crate::connection::Connection;
use crate::datastore::Datastore;
use crate::messages::{ErrorBody, ErrorCode};
use crate::rpc::{SignalService, SERVICE_PATH};

/// Upper bound on an RPC request body
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Signal server state
pub struct SignalServer {
    service: SignalService,
    config: SignalConfig,
}

/// Query string of a realtime upgrade
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    room_id: Option<String>,
    peer_id: Option<String>,
}

impl SignalServer {
    pub fn new(store: Arc<Datastore>, config: SignalConfig) -> Self {
        Self {
            service: SignalService::new(store),
            config,
        }
    }

    pub fn store(&self) -> &Arc<Datastore> {
        self.service.store()
    }

    /// Start the signal server
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.run(listener).await
    }

    /// Serve requests from an already bound listener
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), std::io::Error> {
        self.spawn_idle_sweep();

        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
    }

    fn router(self: Arc<Self>) -> Router {
        let rpc: Router<Arc<SignalServer>> = Router::new()
            .route(&format!("{}:method", SERVICE_PATH), post(call_rpc))
            .layer(TimeoutLayer::new(self.config.request_timeout()))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

        let cors = cors_layer(&self.config);

        Router::new()
            .route("/health", get(health))
            .route("/stats", get(stats))
            .route("/ws", get(realtime))
            .merge(rpc)
            .fallback(not_found)
            .layer(cors)
            .with_state(self)
    }

    fn spawn_idle_sweep(&self) {
        let store = Arc::clone(self.store());
        let every = self.config.cleanup_interval().max(Duration::from_secs(1));
        let idle_timeout = self.config.room_idle_timeout();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.remove_idle_rooms(idle_timeout);
                if removed > 0 {
                    debug!("Idle sweep removed {} rooms", removed);
                }
            }
        });
    }

    /// Run an upgraded peer socket until it goes away
    async fn handle_socket(
        &self,
        socket: WebSocket,
        room_id: String,
        peer_id: String,
        peer_addr: SocketAddr,
    ) {
        let conn = Arc::new(Connection::new(socket, self.config.write_timeout()));
        info!(
            "Peer {} connected to room {} from {} (conn {})",
            peer_id,
            room_id,
            peer_addr,
            conn.id()
        );

        self.run_session(&room_id, &peer_id, &conn).await;

        if let Err(e) = conn.close().await {
            debug!("Closing conn {} failed: {}", conn.id(), e);
        }
        debug!("Connection closed: {} in room {}", peer_id, room_id);
    }

    /// Attach, flush the description, flush candidates, then wait for the peer to go away
    async fn run_session(&self, room_id: &str, peer_id: &str, conn: &Arc<Connection>) {
        let store = self.store();

        match store.set_conn_for_peer(room_id, peer_id, Arc::clone(conn)) {
            Ok(Some(old)) => {
                warn!(
                    "Peer {} reconnected, closing superseded conn {}",
                    peer_id,
                    old.id()
                );
                tokio::spawn(async move {
                    if let Err(e) = old.close().await {
                        debug!("Closing superseded conn {} failed: {}", old.id(), e);
                    }
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "Rejecting connection for peer {} in room {}: {}",
                    peer_id, room_id, e
                );
                return;
            }
        }

        if let Err(e) = store.flush_session_description(room_id, peer_id).await {
            warn!("Description flush to {} failed: {}", peer_id, e);
            self.detach(room_id, peer_id, conn);
            return;
        }

        if let Err(e) = store.flush_ice_candidates(room_id, peer_id).await {
            warn!("Candidate flush to {} failed: {}", peer_id, e);
            self.detach(room_id, peer_id, conn);
            return;
        }

        // Inbound frames carry nothing; the loop only notices the peer leaving
        loop {
            match conn.read_message().await {
                Ok(Some(Message::Close(_))) | Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(e) => {
                    debug!("Read error from {}: {}", peer_id, e);
                    break;
                }
            }
        }

        if self.detach(room_id, peer_id, conn) {
            if let Err(e) = store.remove_peer_from_room(room_id, peer_id) {
                debug!("Removing peer {} from room {} failed: {}", peer_id, room_id, e);
            }
        }
    }

    /// Release `conn` from the peer; true if it was still the peer's connection
    fn detach(&self, room_id: &str, peer_id: &str, conn: &Arc<Connection>) -> bool {
        match self.store().release_conn_for_peer(room_id, peer_id, conn) {
            Ok(true) => true,
            Ok(false) => {
                debug!("Conn {} of peer {} was superseded", conn.id(), peer_id);
                false
            }
            Err(e) => {
                debug!("Peer {} already gone from room {}: {}", peer_id, room_id, e);
                false
            }
        }
    }
}

async fn health(State(server): State<Arc<SignalServer>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "rooms": server.store().room_count(),
        "peers": server.store().peer_count(),
    }))
}

async fn stats(State(server): State<Arc<SignalServer>>) -> Json<serde_json::Value> {
    Json(json!({
        "rooms": server.store().room_count(),
        "peers": server.store().peer_count(),
    }))
}

async fn call_rpc(
    State(server): State<Arc<SignalServer>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let origin = origin(&headers);
    if !server.config.origin_allowed(origin) {
        warn!("Rejected RPC from origin {:?}", origin);
        return error_response(ErrorBody::new(ErrorCode::Forbidden, "origin not allowed"));
    }

    match server.service.call(&method, &body).await {
        Ok(json) => ([(CONTENT_TYPE, "application/json")], json).into_response(),
        Err(e) => {
            debug!("RPC {} failed: {}", method, e);
            error_response(e.to_body())
        }
    }
}

/// Upgrade to WebSocket and run a peer's realtime session
async fn realtime(
    State(server): State<Arc<SignalServer>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<SessionParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let (room_id, peer_id) = match check_handshake(&params, origin(&headers), &server.config) {
        Ok(ids) => ids,
        Err((status, message)) => {
            warn!("Rejected WebSocket handshake from {}: {}", peer_addr, message);
            return (status, message).into_response();
        }
    };

    ws.on_failed_upgrade(move |e| warn!("WebSocket upgrade with {} failed: {}", peer_addr, e))
        .on_upgrade(move |socket| async move {
            server.handle_socket(socket, room_id, peer_id, peer_addr).await
        })
}

async fn not_found() -> Response {
    error_response(ErrorBody::new(ErrorCode::NotFound, "not found"))
}

fn error_response(body: ErrorBody) -> Response {
    (body.code.http_status(), Json(body)).into_response()
}

fn origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(ORIGIN).and_then(|v| v.to_str().ok())
}

/// Validate a realtime upgrade and extract `(room_id, peer_id)`
fn check_handshake(
    params: &SessionParams,
    origin: Option<&str>,
    config: &SignalConfig,
) -> Result<(String, String), (StatusCode, &'static str)> {
    if !config.origin_allowed(origin) {
        return Err((StatusCode::FORBIDDEN, "origin not allowed"));
    }

    let room_id = params.room_id.as_deref().filter(|id| !id.is_empty());
    let peer_id = params.peer_id.as_deref().filter(|id| !id.is_empty());

    match (room_id, peer_id) {
        (Some(room_id), Some(peer_id)) => Ok((room_id.to_string(), peer_id.to_string())),
        (None, None) => Err((StatusCode::BAD_REQUEST, "missing room and peer IDs")),
        (None, _) => Err((StatusCode::BAD_REQUEST, "missing room ID")),
        (_, None) => Err((StatusCode::BAD_REQUEST, "missing peer ID")),
    }
}

/// CORS for browser clients, advertising the configured origin or `*`
fn cors_layer(config: &SignalConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let Some(allowed) = config.allowed_origin.as_deref() else {
        return cors.allow_origin(Any);
    };
    match HeaderValue::from_str(allowed) {
        Ok(value) => cors.allow_origin(value),
        Err(e) => {
            warn!("Allowed origin {:?} is not a valid header value: {}", allowed, e);
            cors.allow_origin(Any)
        }
    }
}
