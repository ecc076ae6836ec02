//! HTTP and WebSocket handlers for the Parley server.
//!
//! The WebSocket route hands every upgraded connection to a
//! [`Session`]; the remaining routes are thin JSON plumbing over the
//! store and the presence service.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, Metered};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parley_core::{
    resolve_room, room::validate_room_id, ChatPipeline, Hub, HubHandle, MemoryStore,
    PersistStore, PresenceError, PresenceService, PresenceStatus, RoomId, Session, StatusInfo,
    StoreError, UserId,
};
use parley_transport::WebSocketConnection;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Display name used when a client gives none.
const DEFAULT_USERNAME: &str = "Anonymous";

/// How often hub gauges are refreshed.
const STATS_PERIOD: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// Handle to the running hub.
    pub hub: HubHandle,
    /// Persistence collaborator.
    pub store: Arc<dyn PersistStore>,
    /// Presence operations over the store.
    pub presence: PresenceService,
    /// Chat message pipeline shared by all sessions.
    pub pipeline: Arc<ChatPipeline>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create state around an in-memory store seeded from the config, and
    /// start the hub.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn PersistStore> = Arc::new(MemoryStore::with_rooms(config.rooms.seed.clone()));
        Self::with_store(config, store)
    }

    /// Create state around an existing store, and start the hub.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn PersistStore>) -> Self {
        let hub = Hub::spawn(config.hub_config());
        let presence =
            PresenceService::new(store.clone()).with_auto_away_timeout(config.auto_away_timeout());
        let pipeline = Arc::new(ChatPipeline::new(
            store.clone(),
            presence.clone(),
            config.delivery_policy(),
            hub.clone(),
        ));

        Self {
            hub,
            store,
            presence,
            pipeline,
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/statuses", get(list_statuses))
        .route(
            "/api/users/:user_id/status",
            get(get_user_status).put(update_user_status),
        )
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(metrics::report_hub_stats(state.hub.clone(), STATS_PERIOD));
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Parley server stopped");
    Ok(())
}

/// Resolve on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::UserNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::RoomExists(_) => StatusCode::CONFLICT,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<PresenceError> for ApiError {
    fn from(e: PresenceError) -> Self {
        match e {
            PresenceError::Store(e) => e.into(),
            PresenceError::ActionNotAllowed { .. } => Self::new(StatusCode::FORBIDDEN, e.to_string()),
            PresenceError::UnknownStatus(_)
            | PresenceError::UnknownAction(_)
            | PresenceError::InvalidStatus { .. } => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hub.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "hub": stats,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "error": e.to_string(),
            })),
        ),
    }
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Display name.
    pub username: Option<String>,
    /// Room to join.
    pub room_id: Option<RoomId>,
    /// Identity already established by the identity layer.
    pub user_id: Option<UserId>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let room_id = resolve_room(
        params.room_id.as_deref(),
        state.store.as_ref(),
        &state.config.rooms.fallback,
    )
    .await;
    validate_room_id(&room_id).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;

    let username = params
        .username
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
    let user_id = params.user_id.filter(|id| !id.is_empty());

    let limit = state.config.limits.max_message_size;
    Ok(ws
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, remote, state, username, room_id, user_id)))
}

/// Run a session over an upgraded WebSocket.
async fn handle_websocket(
    socket: WebSocket,
    remote: SocketAddr,
    state: Arc<AppState>,
    username: String,
    room_id: RoomId,
    user_id: Option<UserId>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = Metered::new(WebSocketConnection::new(socket).with_remote_addr(remote));
    let session = Session::new(Box::new(connection), username, room_id, user_id);
    let session_id = session.id().clone();
    debug!(connection = %session_id, "WebSocket connected");

    match session
        .run(
            state.hub.clone(),
            state.pipeline.clone(),
            state.config.session_config(),
        )
        .await
    {
        Ok(end) => metrics::record_session_end(end.as_str()),
        Err(e) => {
            error!(connection = %session_id, error = %e, "Session could not start");
            metrics::record_error("hub");
        }
    }

    debug!(connection = %session_id, "WebSocket disconnected");
}

/// List rooms.
async fn list_rooms(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_rooms().await?))
}

/// Body of a room creation request.
#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    /// Room name, also used as its id.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
}

/// Create a room.
async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_room_id(&request.name).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let room = state
        .store
        .create_room(&request.name, &request.description)
        .await?;
    info!(room = %room.id, "Room created");
    Ok((StatusCode::CREATED, Json(room)))
}

/// List the capability table.
async fn list_statuses() -> Json<Vec<&'static StatusInfo>> {
    Json(PresenceStatus::ALL.iter().map(PresenceStatus::info).collect())
}

/// Get a user's presence.
async fn get_user_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.presence.presence(&user_id).await?))
}

/// Body of a status update.
#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    /// New status name.
    pub status: String,
    /// Optional status message.
    #[serde(default)]
    pub custom_message: Option<String>,
}

/// Set a user's status.
async fn update_user_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let presence = state
        .presence
        .set_status(&user_id, &request.status, request.custom_message)
        .await?;
    Ok(Json(presence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use parley_core::room::RoomInfo;
    use parley_protocol::{codec::split_batch, decode, MessageKind, WireMessage};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    async fn start() -> (SocketAddr, Arc<AppState>) {
        let mut config = Config::default();
        config.metrics.enabled = false;
        let state = Arc::new(AppState::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, state)
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn connect(addr: SocketAddr, query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws?{}", addr, query))
            .await
            .unwrap();
        ws
    }

    /// Read until a message of `kind` arrives.
    async fn next_of_kind(ws: &mut Client, kind: MessageKind) -> WireMessage {
        while let Some(frame) = ws.next().await {
            if let Message::Text(text) = frame.unwrap() {
                for part in split_batch(text.as_bytes()) {
                    let message = decode(part).unwrap();
                    if message.kind == kind {
                        return message;
                    }
                }
            }
        }
        panic!("Connection closed before {:?} arrived", kind);
    }

    #[tokio::test]
    async fn test_chat_between_clients() {
        let (addr, state) = start().await;
        state.presence.set_status("alice", "online", None).await.unwrap();
        state.presence.set_status("bob", "away", None).await.unwrap();

        let mut alice = connect(addr, "username=alice&room_id=general&user_id=alice").await;
        next_of_kind(&mut alice, MessageKind::UserJoined).await;
        let mut bob = connect(addr, "username=bob&room_id=general&user_id=bob").await;
        next_of_kind(&mut bob, MessageKind::UserJoined).await;

        alice
            .send(Message::Text(
                r#"{"type":"chat_message","content":"hello"}"#.to_string(),
            ))
            .await
            .unwrap();

        for ws in [&mut alice, &mut bob] {
            let message = next_of_kind(ws, MessageKind::ChatMessage).await;
            assert_eq!(message.username.as_deref(), Some("alice"));
            assert_eq!(message.content.as_deref(), Some("hello"));
            assert_eq!(message.room_id.as_deref(), Some("general"));
            let data = message.data.unwrap();
            assert_eq!(data["sender_status"], "online");
            assert_eq!(data["popup"], serde_json::json!([]));
        }

        alice.close(None).await.unwrap();
        let left = next_of_kind(&mut bob, MessageKind::UserLeft).await;
        assert_eq!(left.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_user_without_presence_cannot_post() {
        let (addr, state) = start().await;

        let mut ghost = connect(addr, "username=ghost&room_id=general&user_id=ghost").await;
        next_of_kind(&mut ghost, MessageKind::UserJoined).await;
        ghost
            .send(Message::Text(r#"{"type":"chat_message","content":"boo"}"#.to_string()))
            .await
            .unwrap();

        let mut guest = connect(addr, "username=guest&room_id=general").await;
        next_of_kind(&mut guest, MessageKind::UserJoined).await;
        guest
            .send(Message::Text(r#"{"type":"chat_message","content":"hi"}"#.to_string()))
            .await
            .unwrap();

        // The first chat line anyone sees is the guest's.
        let message = next_of_kind(&mut ghost, MessageKind::ChatMessage).await;
        assert_eq!(message.username.as_deref(), Some("guest"));
        assert!(state.presence.resolve("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (addr, state) = start().await;
        let mut ws = connect(addr, "username=mallory&room_id=general").await;
        next_of_kind(&mut ws, MessageKind::UserJoined).await;

        let content = "x".repeat(state.config.limits.max_message_size * 4);
        let oversized = format!(r#"{{"type":"chat_message","content":"{}"}}"#, content);
        // The server may drop the connection before the send completes.
        let _ = ws.send(Message::Text(oversized)).await;

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    for part in split_batch(text.as_bytes()) {
                        assert_ne!(decode(part).unwrap().kind, MessageKind::ChatMessage);
                    }
                }
            }
        })
        .await;
        assert!(drained.is_ok());

        while state.hub.stats().await.unwrap().session_count > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_defaults_for_anonymous_client() {
        let (addr, state) = start().await;
        let mut ws = connect(addr, "").await;

        let joined = next_of_kind(&mut ws, MessageKind::UserJoined).await;
        assert_eq!(joined.username.as_deref(), Some(DEFAULT_USERNAME));
        assert_eq!(joined.room_id.as_deref(), Some("general"));

        let members = state.hub.room_members("general").await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].user_id.is_none());
    }

    #[tokio::test]
    async fn test_rooms_api() {
        let (addr, _state) = start().await;

        let (status, body) = http(addr, "GET", "/api/rooms", "").await;
        assert_eq!(status, 200);
        let rooms: Vec<RoomInfo> = serde_json::from_value(body).unwrap();
        let ids: Vec<&str> = rooms.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["general", "random", "tech"]);

        let body = r#"{"name":"lobby","description":"Main lobby"}"#;
        assert_eq!(http(addr, "POST", "/api/rooms", body).await.0, 201);
        assert_eq!(http(addr, "POST", "/api/rooms", body).await.0, 409);
        assert_eq!(http(addr, "POST", "/api/rooms", r#"{"name":""}"#).await.0, 400);
    }

    #[tokio::test]
    async fn test_status_api() {
        let (addr, _state) = start().await;
        let path = "/api/users/u1/status";

        let (status, body) = http(addr, "PUT", path, r#"{"status":"sleeping"}"#).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("sleeping"));

        let (status, body) = http(addr, "PUT", path, r#"{"status":"busy","custom_message":"focus"}"#).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "busy");

        let (_, body) = http(addr, "GET", path, "").await;
        assert_eq!(body["status"], "busy");
        assert_eq!(body["custom_message"], "focus");

        assert_eq!(http(addr, "GET", "/api/users/nobody/status", "").await.0, 404);
    }

    #[tokio::test]
    async fn test_statuses_and_health() {
        let (addr, _state) = start().await;

        let (status, body) = http(addr, "GET", "/api/statuses", "").await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().unwrap().len(), 3);
        assert_eq!(body[1]["status"], "away");
        assert_eq!(body[1]["can_send_messages"], false);

        let (status, body) = http(addr, "GET", "/health", "").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["hub"]["session_count"], 0);
    }

    /// Minimal HTTP/1.1 exchange over a fresh TCP stream.
    async fn http(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, serde_json::Value) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method,
            path,
            addr,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(body).unwrap()
        };
        (status, json)
    }
}
