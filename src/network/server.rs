//! WebSocket Server
//!
//! Async WebSocket server for Roamie clients.
//! Handles login, user state requests, and avatar moves.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock, broadcast};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::collect::drop::DropCatalog;
use crate::collect::equip::Equipped;
use crate::core::geo::GeoPoint;
use crate::network::auth::{validate_token, AuthConfig, AuthError};
use crate::network::protocol::{
    AuthRequest, AvatarMove, ClientMessage, CollectedItem, ErrorCode, MoveResult,
    ServerError, ServerMessage, UserState, UserSummary,
};
use crate::network::session::{SessionError, SessionManager};
use crate::store::{StoreError, UserId, UserRecord, UserStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Idle time before a connection or detached session is dropped.
    pub idle_timeout: Duration,
    /// How often the cleanup pass runs.
    pub cleanup_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    ///
    /// `ROAMIE_BIND` sets the full address; `PORT` overrides just the port.
    /// Unparseable values fall back to the defaults with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bind) = std::env::var("ROAMIE_BIND") {
            match bind.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(e) => warn!("Ignoring ROAMIE_BIND={}: {}", bind, e),
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => config.bind_addr.set_port(port),
                Err(e) => warn!("Ignoring PORT={}: {}", port, e),
            }
        }
        if let Some(max) = env_parse::<usize>("ROAMIE_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(secs) = env_parse::<u64>("ROAMIE_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={}: not a number", key, raw);
            None
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum RoamieServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Time allowed for the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connected client state.
///
/// Inserted when the TCP connection is accepted, so connections still in
/// the handshake count against the limit.
struct ConnectedClient {
    /// User this connection is logged in as.
    user_id: Option<UserId>,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
    /// Tells the connection task to close the socket.
    close_tx: Option<oneshot::Sender<()>>,
}

impl ConnectedClient {
    fn new(close_tx: oneshot::Sender<()>) -> Self {
        let now = Instant::now();
        Self {
            user_id: None,
            connected_at: now,
            last_activity: now,
            close_tx: Some(close_tx),
        }
    }
}

type ClientMap = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The Roamie server.
pub struct RoamieServer {
    /// Server configuration.
    config: ServerConfig,
    /// Token validation settings.
    auth: Arc<AuthConfig>,
    /// User sessions (owns the store and catalog).
    sessions: Arc<SessionManager>,
    /// Connected clients.
    clients: ClientMap,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl RoamieServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        store: Arc<UserStore>,
        catalog: Arc<DropCatalog>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            auth: Arc::new(auth),
            sessions: Arc::new(SessionManager::new(store, catalog)),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind and run until shutdown.
    pub async fn run(&self) -> Result<(), RoamieServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Run on an already bound listener.
    #[instrument(skip(self, listener))]
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), RoamieServerError> {
        info!("Roamie server listening on {}", listener.local_addr()?);

        let cleanup_clients = self.clients.clone();
        let cleanup_sessions = self.sessions.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_every = self.config.cleanup_interval;

        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_sessions, idle_timeout, cleanup_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            // Reserve the slot before the handshake
                            let close_rx = {
                                let mut clients = self.clients.write().await;
                                if clients.len() >= self.config.max_connections {
                                    warn!("Connection limit reached, rejecting {}", addr);
                                    continue;
                                }
                                let (close_tx, close_rx) = oneshot::channel();
                                clients.insert(addr, ConnectedClient::new(close_tx));
                                close_rx
                            };

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr, close_rx);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, mut close_rx: oneshot::Receiver<()>) {
        let clients = self.clients.clone();
        let sessions = self.sessions.clone();
        let auth = self.auth.clone();
        let version = self.config.version.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    clients.write().await.remove(&addr);
                    return;
                }
                Err(_) => {
                    warn!("WebSocket handshake timed out for {}", addr);
                    clients.write().await.remove(&addr);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let handler = ConnectionHandler {
                addr,
                clients: clients.clone(),
                sessions: sessions.clone(),
                auth,
                version,
                sender: msg_tx.clone(),
            };

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                handler.touch().await;
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => handler.handle(client_msg).await,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        handler.reply_error(ErrorCode::InvalidInput, "Invalid message format").await;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                handler.touch().await;
                                match AvatarMove::from_bytes(&data) {
                                    Ok(mv) => handler.handle(ClientMessage::Move(mv)).await,
                                    Err(e) => {
                                        debug!("Invalid binary frame from {}: {}", addr, e);
                                        handler.reply_error(ErrorCode::InvalidInput, "Invalid binary move").await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut close_rx => {
                        info!("Closing idle connection {}", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let queued replies (including the shutdown notice) drain
            drop(handler);
            drop(msg_tx);
            let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;

            let removed = clients.write().await.remove(&addr);
            if let Some(ConnectedClient { user_id: Some(user_id), connected_at, .. }) = removed {
                sessions.detach(user_id).await;
                debug!("User {} was connected for {:?}", user_id, connected_at.elapsed());
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(
        clients: ClientMap,
        sessions: Arc<SessionManager>,
        idle_timeout: Duration,
        every: Duration,
    ) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            // Idle connections are closed; their task removes the entry and detaches the user
            let now = Instant::now();
            let idle: Vec<(SocketAddr, oneshot::Sender<()>)> = {
                let mut clients = clients.write().await;
                clients
                    .iter_mut()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .filter_map(|(addr, c)| c.close_tx.take().map(|tx| (*addr, tx)))
                    .collect()
            };

            for (addr, close_tx) in idle {
                if close_tx.send(()).is_ok() {
                    debug!("Signalled idle client {} to close", addr);
                }
            }

            sessions.cleanup(idle_timeout).await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }
}

// =============================================================================
// MESSAGE HANDLING
// =============================================================================

/// Per-connection message handler.
struct ConnectionHandler {
    addr: SocketAddr,
    clients: ClientMap,
    sessions: Arc<SessionManager>,
    auth: Arc<AuthConfig>,
    version: String,
    sender: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandler {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.sender.send(msg).await;
    }

    async fn reply_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.send(ServerMessage::Error(ServerError::new(code, message))).await;
    }

    async fn touch(&self) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&self.addr) {
            client.last_activity = Instant::now();
        }
    }

    async fn user_id(&self) -> Option<UserId> {
        let clients = self.clients.read().await;
        clients.get(&self.addr).and_then(|c| c.user_id)
    }

    /// Dispatch one client message.
    async fn handle(&self, msg: ClientMessage) {
        match msg {
            ClientMessage::Login { username } => self.handle_login(&username).await,
            ClientMessage::Auth(auth) => self.handle_auth(auth).await,
            ClientMessage::Ping { timestamp } => {
                self.send(ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
                })
                .await;
            }
            other => {
                let Some(user_id) = self.user_id().await else {
                    self.reply_error(ErrorCode::NotAuthenticated, "Must log in first").await;
                    return;
                };
                self.handle_authenticated(user_id, other).await;
            }
        }
    }

    async fn handle_authenticated(&self, user_id: UserId, msg: ClientMessage) {
        let store = self.sessions.store();
        let reply = match msg {
            ClientMessage::GetState => store
                .user(user_id)
                .await
                .map(|user| ServerMessage::State(user.into()))
                .map_err(SessionError::from),
            ClientMessage::AddMarker { latitude, longitude } => store
                .add_marker(user_id, GeoPoint::new(latitude, longitude))
                .await
                .map(ServerMessage::MarkerAdded)
                .map_err(SessionError::from),
            ClientMessage::ListUsers => Ok(ServerMessage::Users {
                users: store.users().await.iter().map(UserSummary::from).collect(),
            }),
            ClientMessage::ClearMarkers => store
                .clear_markers(user_id)
                .await
                .map(|_| ServerMessage::MarkersCleared)
                .map_err(SessionError::from),
            ClientMessage::Equip(equipped) => self.handle_equip(user_id, equipped).await,
            ClientMessage::SetCollected { items } => self
                .sessions
                .set_collected(user_id, items)
                .await
                .map(|user| ServerMessage::CollectedUpdated {
                    collected_items: user.collected_items.into_iter().collect(),
                }),
            ClientMessage::Move(mv) => self.handle_move(user_id, mv).await,
            ClientMessage::Logout => {
                self.handle_logout(user_id).await;
                return;
            }
            ClientMessage::Login { .. } | ClientMessage::Auth(_) | ClientMessage::Ping { .. } => {
                return;
            }
        };

        match reply {
            Ok(msg) => self.send(msg).await,
            Err(e) => self.send_session_error(user_id, e).await,
        }
    }

    async fn handle_login(&self, username: &str) {
        match self.sessions.store().login(username).await {
            Ok(user) => self.complete_login(user).await,
            Err(StoreError::UsernameRequired) => {
                self.reply_error(ErrorCode::InvalidInput, "Username required").await;
            }
            Err(e @ StoreError::TokenAccount(_)) => {
                warn!("Username login refused for {}: {}", self.addr, e);
                self.reply_error(ErrorCode::AuthFailed, e.to_string()).await;
            }
            Err(e) => {
                error!("Login failed for {}: {}", self.addr, e);
                self.reply_error(ErrorCode::StorageFailure, "Login failed").await;
            }
        }
    }

    async fn handle_auth(&self, auth: AuthRequest) {
        if !auth.client_version.is_empty() && auth.client_version != self.version {
            debug!("Client {} on version {} (server {})", self.addr, auth.client_version, self.version);
        }

        let claims = match validate_token(&auth.token, &self.auth) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("Token rejected for {}: {}", self.addr, e);
                let code = match e {
                    AuthError::Expired => ErrorCode::TokenExpired,
                    AuthError::NotConfigured => ErrorCode::AuthFailed,
                    _ => ErrorCode::InvalidToken,
                };
                self.reply_error(code, e.to_string()).await;
                return;
            }
        };

        let login = self
            .sessions
            .store()
            .login_with_token(&claims.subject(), &claims.username())
            .await;
        match login {
            Ok(user) => self.complete_login(user).await,
            Err(e) => {
                error!("Token login failed for {}: {}", self.addr, e);
                self.reply_error(ErrorCode::StorageFailure, "Login failed").await;
            }
        }
    }

    async fn complete_login(&self, user: UserRecord) {
        // Switching accounts on a live socket releases the old session
        let previous = {
            let mut clients = self.clients.write().await;
            match clients.get_mut(&self.addr) {
                Some(client) => client.user_id.replace(user.id),
                None => None,
            }
        };
        if let Some(previous) = previous {
            self.sessions.detach(previous).await;
        }

        self.sessions.attach(&user).await;
        info!("Client {} logged in as {} ({})", self.addr, user.username, user.id);
        self.send(ServerMessage::LoginResult(UserState::from(user))).await;
    }

    async fn handle_logout(&self, user_id: UserId) {
        {
            let mut clients = self.clients.write().await;
            if let Some(client) = clients.get_mut(&self.addr) {
                client.user_id = None;
            }
        }
        self.sessions.detach(user_id).await;
        debug!("Client {} logged out", self.addr);
    }

    async fn handle_equip(&self, user_id: UserId, equipped: Equipped) -> Result<ServerMessage, SessionError> {
        self.sessions
            .equip(user_id, equipped)
            .await
            .map(ServerMessage::Equipped)
    }

    async fn handle_move(&self, user_id: UserId, mv: AvatarMove) -> Result<ServerMessage, SessionError> {
        let outcome = self.sessions.apply_move(user_id, mv.to_point()).await?;

        if !outcome.events.is_empty() {
            self.send(ServerMessage::ItemsCollected {
                items: outcome.events.iter().map(CollectedItem::from).collect(),
            })
            .await;
        }

        Ok(ServerMessage::MoveResult(MoveResult {
            latitude: outcome.position.latitude,
            longitude: outcome.position.longitude,
            newly_collected: outcome.newly_collected,
            total_collected: outcome.total_collected,
        }))
    }

    async fn send_session_error(&self, user_id: UserId, err: SessionError) {
        let code = error_code(&err);
        match code {
            ErrorCode::StorageFailure | ErrorCode::InternalError => {
                error!("Request from user {} failed: {}", user_id, err);
            }
            _ => warn!("Request from user {} rejected: {}", user_id, err),
        }
        self.reply_error(code, err.to_string()).await;
    }
}

/// Map a session error onto a protocol error code.
fn error_code(err: &SessionError) -> ErrorCode {
    match err {
        SessionError::Collect(_) | SessionError::UnknownItem(_) => ErrorCode::InvalidInput,
        SessionError::Equip(_) => ErrorCode::InvalidLoadout,
        SessionError::Store(store_err) => match store_err {
            StoreError::UsernameRequired | StoreError::InvalidPosition(_) => ErrorCode::InvalidInput,
            StoreError::TokenAccount(_) => ErrorCode::AuthFailed,
            StoreError::UserNotFound(_) => ErrorCode::UserNotFound,
            StoreError::Io(_) | StoreError::Serialization(_) | StoreError::Backend(_) => {
                ErrorCode::StorageFailure
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::engine::CollectError;
    use crate::core::geo::GeoError;
    use crate::network::auth::TokenClaims;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const CROWN: AvatarMove = AvatarMove {
        latitude: 43.03881471145394,
        longitude: -71.45190238952638,
    };

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    fn test_server(config: ServerConfig, auth: AuthConfig) -> RoamieServer {
        RoamieServer::new(
            config,
            auth,
            Arc::new(UserStore::in_memory()),
            Arc::new(DropCatalog::builtin()),
        )
    }

    struct Running {
        server: Arc<RoamieServer>,
        addr: SocketAddr,
        task: JoinHandle<Result<(), RoamieServerError>>,
    }

    impl Running {
        async fn start(config: ServerConfig, auth: AuthConfig) -> Self {
            let server = Arc::new(test_server(config, auth));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let running = server.clone();
            let task = tokio::spawn(async move { running.run_with_listener(listener).await });
            Self { server, addr, task }
        }

        async fn try_connect(&self) -> Result<Client, tokio_tungstenite::tungstenite::Error> {
            connect_async(format!("ws://{}", self.addr)).await.map(|(ws, _)| ws)
        }

        async fn connect(&self) -> Client {
            self.try_connect().await.unwrap()
        }

        async fn stop(self) {
            self.server.shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
        }
    }

    async fn send(ws: &mut Client, msg: ClientMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ServerMessage {
        let next = async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return ServerMessage::from_json(&text).unwrap(),
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {:?}", other),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), next).await.unwrap()
    }

    async fn expect_error(ws: &mut Client, code: ErrorCode) {
        match recv(ws).await {
            ServerMessage::Error(e) => assert_eq!(e.code, code, "message: {}", e.message),
            other => panic!("expected {:?}, got {:?}", code, other),
        }
    }

    async fn login(ws: &mut Client, username: &str) -> UserState {
        send(ws, ClientMessage::Login { username: username.into() }).await;
        match recv(ws).await {
            ServerMessage::LoginResult(state) => state,
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn wait_for_connections(server: &RoamieServer, expected: usize) -> bool {
        for _ in 0..100 {
            if server.connection_count().await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.max_connections, 1000);
    }

    #[test]
    fn test_error_codes_for_session_errors() {
        let invalid = SessionError::Collect(CollectError::InvalidInput(GeoError::LatitudeOutOfRange(95.0)));
        assert_eq!(error_code(&invalid), ErrorCode::InvalidInput);

        let missing = SessionError::Store(StoreError::UserNotFound(UserId(1)));
        assert_eq!(error_code(&missing), ErrorCode::UserNotFound);

        let disk = SessionError::Store(StoreError::Backend("disk full".into()));
        assert_eq!(error_code(&disk), ErrorCode::StorageFailure);

        let bound = SessionError::Store(StoreError::TokenAccount("quark".into()));
        assert_eq!(error_code(&bound), ErrorCode::AuthFailed);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = test_server(local_config(), AuthConfig::default());
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_login_and_collect_over_websocket() {
        let running = Running::start(local_config(), AuthConfig::default()).await;
        let mut ws = running.connect().await;

        let state = login(&mut ws, "Quark").await;
        assert_eq!(state.username, "quark");
        assert!(state.collected_items.is_empty());

        send(&mut ws, ClientMessage::Move(CROWN)).await;
        match recv(&mut ws).await {
            ServerMessage::ItemsCollected { items } => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, "hat_crown");
            }
            other => panic!("unexpected {:?}", other),
        }
        match recv(&mut ws).await {
            ServerMessage::MoveResult(result) => {
                assert_eq!(result.newly_collected, vec!["hat_crown".to_string()]);
                assert_eq!(result.total_collected, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Same spot again over the binary channel: nothing new
        ws.send(Message::Binary(CROWN.to_bytes().unwrap())).await.unwrap();
        match recv(&mut ws).await {
            ServerMessage::MoveResult(result) => assert!(result.newly_collected.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        // Bad coordinates are rejected without dropping the connection
        send(&mut ws, ClientMessage::Move(AvatarMove { latitude: 123.0, longitude: 0.0 })).await;
        expect_error(&mut ws, ErrorCode::InvalidInput).await;

        send(&mut ws, ClientMessage::GetState).await;
        match recv(&mut ws).await {
            ServerMessage::State(state) => {
                assert_eq!(state.collected_items, vec!["hat_crown".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }

        running.stop().await;
    }

    #[tokio::test]
    async fn test_messages_require_login() {
        let running = Running::start(local_config(), AuthConfig::default()).await;
        let mut ws = running.connect().await;

        let gated = vec![
            ClientMessage::GetState,
            ClientMessage::ListUsers,
            ClientMessage::AddMarker { latitude: 43.04, longitude: -71.45 },
            ClientMessage::ClearMarkers,
            ClientMessage::Equip(Equipped::default()),
            ClientMessage::SetCollected { items: vec!["hat_crown".into()] },
            ClientMessage::Move(CROWN),
            ClientMessage::Logout,
        ];
        for msg in gated {
            send(&mut ws, msg).await;
            expect_error(&mut ws, ErrorCode::NotAuthenticated).await;
        }

        // Ping needs no login
        send(&mut ws, ClientMessage::Ping { timestamp: 42 }).await;
        match recv(&mut ws).await {
            ServerMessage::Pong { timestamp, .. } => assert_eq!(timestamp, 42),
            other => panic!("unexpected {:?}", other),
        }

        running.stop().await;
    }

    #[tokio::test]
    async fn test_markers_loadout_and_users() {
        let running = Running::start(local_config(), AuthConfig::default()).await;
        let mut ws = running.connect().await;
        login(&mut ws, "quark").await;

        send(&mut ws, ClientMessage::AddMarker { latitude: 43.04, longitude: -71.45 }).await;
        match recv(&mut ws).await {
            ServerMessage::MarkerAdded(marker) => assert_eq!(marker.latitude, 43.04),
            other => panic!("unexpected {:?}", other),
        }
        send(&mut ws, ClientMessage::AddMarker { latitude: 200.0, longitude: 0.0 }).await;
        expect_error(&mut ws, ErrorCode::InvalidInput).await;

        send(&mut ws, ClientMessage::GetState).await;
        match recv(&mut ws).await {
            ServerMessage::State(state) => assert_eq!(state.markers.len(), 1),
            other => panic!("unexpected {:?}", other),
        }

        send(&mut ws, ClientMessage::ClearMarkers).await;
        assert!(matches!(recv(&mut ws).await, ServerMessage::MarkersCleared));

        let crown_hat = Equipped { hat: Some("hat_crown".into()), ..Default::default() };
        send(&mut ws, ClientMessage::Equip(crown_hat.clone())).await;
        expect_error(&mut ws, ErrorCode::InvalidLoadout).await;

        send(&mut ws, ClientMessage::SetCollected { items: vec!["hat_crown".into()] }).await;
        match recv(&mut ws).await {
            ServerMessage::CollectedUpdated { collected_items } => {
                assert_eq!(collected_items, vec!["hat_crown".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }

        send(&mut ws, ClientMessage::Equip(crown_hat.clone())).await;
        match recv(&mut ws).await {
            ServerMessage::Equipped(equipped) => assert_eq!(equipped, crown_hat),
            other => panic!("unexpected {:?}", other),
        }

        // A hat in the body slot
        let misplaced = Equipped { body: Some("hat_crown".into()), ..Default::default() };
        send(&mut ws, ClientMessage::Equip(misplaced)).await;
        expect_error(&mut ws, ErrorCode::InvalidLoadout).await;

        send(&mut ws, ClientMessage::SetCollected { items: vec!["hat_tophat".into()] }).await;
        expect_error(&mut ws, ErrorCode::InvalidInput).await;

        let mut other = running.connect().await;
        login(&mut other, "odo").await;
        send(&mut ws, ClientMessage::ListUsers).await;
        match recv(&mut ws).await {
            ServerMessage::Users { users } => {
                let names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
                assert_eq!(names, vec!["quark", "odo"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        running.stop().await;
    }

    #[tokio::test]
    async fn test_logout_then_move_rejected() {
        let running = Running::start(local_config(), AuthConfig::default()).await;
        let mut ws = running.connect().await;
        login(&mut ws, "quark").await;

        send(&mut ws, ClientMessage::Logout).await;
        send(&mut ws, ClientMessage::Move(CROWN)).await;
        expect_error(&mut ws, ErrorCode::NotAuthenticated).await;

        // Nothing was collected for the logged-out user
        let state = login(&mut ws, "quark").await;
        assert!(state.collected_items.is_empty());

        running.stop().await;
    }

    #[tokio::test]
    async fn test_connection_limit_reserves_slot() {
        let config = ServerConfig { max_connections: 1, ..local_config() };
        let running = Running::start(config, AuthConfig::default()).await;

        let mut first = running.connect().await;
        assert!(running.try_connect().await.is_err());

        first.close(None).await.unwrap();
        assert!(wait_for_connections(&running.server, 0).await);

        let mut second = running.connect().await;
        login(&mut second, "quark").await;

        running.stop().await;
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let config = ServerConfig {
            max_connections: 1,
            idle_timeout: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(20),
            ..local_config()
        };
        let running = Running::start(config, AuthConfig::default()).await;

        let mut silent = running.connect().await;
        login(&mut silent, "quark").await;
        assert_eq!(running.server.session_count().await, 1);

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match silent.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(wait_for_connections(&running.server, 0).await);

        // The slot is free again
        let mut next = running.connect().await;
        send(&mut next, ClientMessage::Ping { timestamp: 1 }).await;
        assert!(matches!(recv(&mut next).await, ServerMessage::Pong { .. }));

        // The detached session ages out on a later pass
        let mut sessions_left = running.server.session_count().await;
        for _ in 0..100 {
            if sessions_left == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            sessions_left = running.server.session_count().await;
        }
        assert_eq!(sessions_left, 0);

        running.stop().await;
    }

    #[tokio::test]
    async fn test_token_login_binds_account() {
        const SECRET: &str = "roamie-server-test-secret-0123456789";
        let auth = AuthConfig { secret: Some(SECRET.into()), ..Default::default() };
        let running = Running::start(local_config(), auth).await;

        let now = chrono::Utc::now().timestamp() as u64;
        let claims = TokenClaims {
            sub: "1082".into(),
            exp: now + 3600,
            iat: now,
            iss: Some("https://accounts.google.com".into()),
            aud: Some(serde_json::json!("roamie-client")),
            email: Some("Victim@Gmail.com".into()),
            name: None,
        };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let mut owner = running.connect().await;
        send(&mut owner, ClientMessage::Auth(AuthRequest { token, client_version: String::new() })).await;
        let owner_id = match recv(&mut owner).await {
            ServerMessage::LoginResult(state) => {
                assert_eq!(state.username, "victim@gmail.com");
                state.id
            }
            other => panic!("unexpected {:?}", other),
        };

        let mut intruder = running.connect().await;
        send(&mut intruder, ClientMessage::Login { username: "victim@gmail.com".into() }).await;
        expect_error(&mut intruder, ErrorCode::AuthFailed).await;

        // Still not logged in as anyone
        send(&mut intruder, ClientMessage::GetState).await;
        expect_error(&mut intruder, ErrorCode::NotAuthenticated).await;

        let intruder_state = login(&mut intruder, "someone-else").await;
        assert_ne!(intruder_state.id, owner_id);

        running.stop().await;
    }

    #[tokio::test]
    async fn test_token_login_without_auth_config() {
        let running = Running::start(local_config(), AuthConfig::default()).await;
        let mut ws = running.connect().await;

        let auth = ClientMessage::Auth(AuthRequest {
            token: "a.b.c".into(),
            client_version: String::new(),
        });
        send(&mut ws, auth).await;
        expect_error(&mut ws, ErrorCode::AuthFailed).await;

        running.stop().await;
    }
}
