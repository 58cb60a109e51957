//! Connection lifecycle: connect → login → capability probe → ready.
//!
//! ```text
//! Disconnected ─connect()─► ConnectionStarted ─open ok─► ConnectionCompleted
//!                                │                            │
//!                           open fails                   LoginStarted
//!                                ▼                      │            │
//!                         ConnectionFailed          reply ok    socket dropped
//!                                                       ▼            ▼
//!                                               LoginCompleted   LoginFailed
//!                                                       │
//!                                        probe ok: HandshakeCompleted event
//!                                        probe fails/times out: Disconnected
//! ```
//!
//! Every transition is published on the bus while the state lock is held,
//! so listeners observe transitions in exactly the order they happen. Each
//! connection attempt carries a generation number; `disconnect()` bumps it,
//! which turns any still-running attempt into a no-op.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::bus::{BusEvent, SharedBus};
use crate::error::{CliError, CliResult};
use crate::library::Item;
use crate::protocol::{Command, ProtocolSession, Reply, Requester, SessionOptions, DEFAULT_CLI_PORT};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    ConnectionStarted,
    ConnectionFailed,
    ConnectionCompleted,
    LoginStarted,
    LoginCompleted,
    LoginFailed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::ConnectionStarted => "connection_started",
            Self::ConnectionFailed => "connection_failed",
            Self::ConnectionCompleted => "connection_completed",
            Self::LoginStarted => "login_started",
            Self::LoginCompleted => "login_completed",
            Self::LoginFailed => "login_failed",
        };
        f.write_str(name)
    }
}

/// Plaintext credentials; both absent means the server needs none.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// `(user, pass)` when a login line should be sent.
    fn login_pair(&self) -> Option<(&str, &str)> {
        let username = self.username.as_deref().filter(|u| !u.is_empty())?;
        Some((username, self.password.as_deref().unwrap_or("")))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "******"))
            .finish()
    }
}

/// Album ordering the server prefers for album lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlbumSort {
    #[default]
    Album,
    Artflow,
    ArtistAlbum,
    YearAlbum,
    YearArtistAlbum,
    New,
    Other(String),
}

impl AlbumSort {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Album => "album",
            Self::Artflow => "artflow",
            Self::ArtistAlbum => "artistalbum",
            Self::YearAlbum => "yearalbum",
            Self::YearArtistAlbum => "yearartistalbum",
            Self::New => "new",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for AlbumSort {
    fn from(s: &str) -> Self {
        match s {
            "album" => Self::Album,
            "artflow" => Self::Artflow,
            "artistalbum" => Self::ArtistAlbum,
            "yearalbum" => Self::YearAlbum,
            "yearartistalbum" => Self::YearArtistAlbum,
            "new" => Self::New,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for AlbumSort {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<AlbumSort> for String {
    fn from(sort: AlbumSort) -> Self {
        sort.as_str().to_string()
    }
}

/// Capabilities and preferences probed right after login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub can_music_folders: bool,
    pub can_random_play: bool,
    /// Web port, used for artwork URLs.
    pub http_port: Option<u16>,
    pub album_sort: AlbumSort,
    pub server_version: String,
    pub completed_at: DateTime<Utc>,
}

impl HandshakeResult {
    /// `http://<host>:<httpport>/music/<artwork>/cover.jpg` for an item with artwork.
    pub fn artwork_url(&self, host: &str, item: &Item) -> Option<Url> {
        let port = self.http_port?;
        let artwork = item.artwork.as_deref()?;
        Url::parse(&format!(
            "http://{}:{}/music/{}/cover.jpg",
            host,
            port,
            urlencoding::encode(artwork)
        ))
        .ok()
    }
}

/// Run the fixed probe sequence and assemble the handshake.
///
/// Any failure is returned as-is; a reply that cannot be read is
/// `MalformedReply`.
pub async fn probe_capabilities(session: &dyn Requester) -> CliResult<HandshakeResult> {
    let can_music_folders = probe_flag(session, "musicfolder").await?;
    let can_random_play = probe_flag(session, "randomplay").await?;

    let reply = session.request(Command::new(["pref", "httpport", "?"])).await?;
    let http_port = match reply.value() {
        Some(raw) => Some(raw.parse::<u16>().map_err(|_| {
            CliError::malformed("pref httpport ?", format!("'{}' is not a port", raw))
        })?),
        None => None,
    };

    let reply = session
        .request(Command::new(["pref", "jivealbumsort", "?"]))
        .await?;
    let album_sort = reply.value().map(AlbumSort::from).unwrap_or_default();

    let reply = session.request(Command::new(["version", "?"])).await?;
    let server_version = reply
        .value()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CliError::malformed("version ?", "missing version"))?
        .to_string();

    Ok(HandshakeResult {
        can_music_folders,
        can_random_play,
        http_port,
        album_sort,
        server_version,
        completed_at: Utc::now(),
    })
}

async fn probe_flag(session: &dyn Requester, capability: &str) -> CliResult<bool> {
    let reply: Reply = session
        .request(Command::new(["can", capability, "?"]))
        .await?;
    match reply.value() {
        Some("1") => Ok(true),
        Some("0") => Ok(false),
        other => Err(CliError::malformed(
            format!("can {} ?", capability),
            format!("expected 0 or 1, got {:?}", other),
        )),
    }
}

/// Timeouts and behaviour of connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub session: SessionOptions,
    /// Bound on the whole connect → login → probe sequence.
    pub handshake_timeout: Duration,
    /// Send `listen 1` once the handshake completes.
    pub subscribe_events: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            subscribe_events: true,
        }
    }
}

/// Append the default CLI port when the address has none.
pub fn with_default_port(address: &str) -> String {
    if address.parse::<std::net::SocketAddr>().is_ok() {
        return address.to_string();
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ if address.contains(':') => format!("[{}]:{}", address, DEFAULT_CLI_PORT),
        _ => format!("{}:{}", address, DEFAULT_CLI_PORT),
    }
}

/// Host part of a `host:port` address.
fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => address,
    }
}

/// Connection-level notification seen by a [`StateSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    HandshakeCompleted(HandshakeResult),
}

/// Listener for state changes and handshake completions.
///
/// The first event is always the state current at subscription time.
/// Dropping the subscription unsubscribes.
pub struct StateSubscription {
    initial: Option<ConnectionState>,
    rx: broadcast::Receiver<BusEvent>,
}

impl StateSubscription {
    /// Next connection event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        if let Some(state) = self.initial.take() {
            return Some(ConnectionEvent::StateChanged(state));
        }
        loop {
            match self.rx.recv().await {
                Ok(BusEvent::ConnectionStateChanged { state }) => {
                    return Some(ConnectionEvent::StateChanged(state))
                }
                Ok(BusEvent::HandshakeCompleted { handshake }) => {
                    return Some(ConnectionEvent::HandshakeCompleted(handshake))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("state subscription lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Completion signal of one `connect()` call.
pub struct ConnectAttempt {
    result: oneshot::Receiver<CliResult<HandshakeResult>>,
}

impl ConnectAttempt {
    /// Wait for the handshake (or the reason the attempt ended).
    pub async fn wait(self) -> CliResult<HandshakeResult> {
        self.result.await.unwrap_or(Err(CliError::SessionClosed))
    }
}

struct StateCell {
    state: ConnectionState,
    generation: u64,
    address: Option<String>,
    session: Option<Arc<ProtocolSession>>,
    handshake: Option<HandshakeResult>,
    attempt: Option<CancellationToken>,
}

struct Inner {
    bus: SharedBus,
    options: ConnectOptions,
    cell: Mutex<StateCell>,
}

/// Owns the session of the current connection attempt and its lifecycle.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<Inner>,
}

impl ConnectionStateMachine {
    pub fn new(bus: SharedBus, options: ConnectOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                options,
                cell: Mutex::new(StateCell {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    address: None,
                    session: None,
                    handshake: None,
                    attempt: None,
                }),
            }),
        }
    }

    fn cell(&self) -> MutexGuard<'_, StateCell> {
        self.inner.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bus(&self) -> &SharedBus {
        &self.inner.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.cell().state
    }

    /// Most recent successful handshake, kept until a new one replaces it.
    pub fn handshake(&self) -> Option<HandshakeResult> {
        self.cell().handshake.clone()
    }

    /// Address of the current or last attempt.
    pub fn address(&self) -> Option<String> {
        self.cell().address.clone()
    }

    /// The live session, once login has completed.
    pub fn session(&self) -> Option<Arc<ProtocolSession>> {
        let cell = self.cell();
        match cell.state {
            ConnectionState::LoginCompleted => cell.session.clone(),
            _ => None,
        }
    }

    /// Subscribe to state changes; the current state is delivered first.
    pub fn subscribe(&self) -> StateSubscription {
        let cell = self.cell();
        StateSubscription {
            initial: Some(cell.state),
            rx: self.inner.bus.subscribe(),
        }
    }

    /// Artwork URL for an item, using the current server host and handshake.
    pub fn artwork_url(&self, item: &Item) -> Option<Url> {
        let cell = self.cell();
        let address = cell.address.as_deref()?;
        cell.handshake.as_ref()?.artwork_url(host_of(address), item)
    }

    /// Start a connection attempt on a background task.
    ///
    /// Any previous connection is torn down first. State events are
    /// delivered asynchronously; the returned handle resolves when the
    /// handshake completes or the attempt ends.
    pub fn connect(&self, address: &str, credentials: Credentials) -> ConnectAttempt {
        let address = with_default_port(address);
        self.teardown(None, "reconnect");

        let (generation, token) = {
            let mut cell = self.cell();
            cell.generation += 1;
            let token = CancellationToken::new();
            cell.attempt = Some(token.clone());
            cell.address = Some(address.clone());
            (cell.generation, token)
        };

        let (tx, rx) = oneshot::channel();
        let machine = self.clone();
        tokio::spawn(async move {
            let result = machine.run_attempt(generation, token, &address, &credentials).await;
            if tx.send(result).is_err() {
                debug!(address = %address, "connect attempt finished with nobody waiting");
            }
        });

        ConnectAttempt { result: rx }
    }

    /// Drop to `Disconnected`. Emits exactly one `Disconnected` event no
    /// matter how often it is called; also cancels an attempt in progress.
    pub fn disconnect(&self) {
        self.teardown(None, "disconnect requested");
    }

    async fn run_attempt(
        &self,
        generation: u64,
        token: CancellationToken,
        address: &str,
        credentials: &Credentials,
    ) -> CliResult<HandshakeResult> {
        let limit = self.inner.options.handshake_timeout;
        tokio::select! {
            _ = token.cancelled() => Err(CliError::SessionClosed),
            result = timeout(limit, self.establish(generation, address, credentials)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(address, "handshake did not finish within {:?}", limit);
                        self.teardown(Some(generation), "handshake timeout");
                        Err(CliError::Timeout {
                            command: "handshake".to_string(),
                            after: limit,
                        })
                    }
                }
            }
        }
    }

    async fn establish(
        &self,
        generation: u64,
        address: &str,
        credentials: &Credentials,
    ) -> CliResult<HandshakeResult> {
        self.advance(generation, ConnectionState::ConnectionStarted)?;
        info!(address, "connecting");

        let options = self.inner.options;
        let session = match ProtocolSession::open(address, options.session, self.inner.bus.clone()).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(address, "connection failed: {}", e);
                self.advance(generation, ConnectionState::ConnectionFailed)?;
                return Err(e);
            }
        };

        if !self.install_session(generation, session.clone()) {
            session.close();
            return Err(CliError::SessionClosed);
        }
        self.advance(generation, ConnectionState::ConnectionCompleted)?;

        self.advance(generation, ConnectionState::LoginStarted)?;
        if let Err(e) = login(&session, credentials).await {
            return Err(self.login_failed(generation, e));
        }
        self.advance(generation, ConnectionState::LoginCompleted)?;

        let handshake = match probe_capabilities(session.as_ref()).await {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(address, "capability probe failed: {}", e);
                self.teardown(Some(generation), "capability probe failed");
                return Err(e);
            }
        };

        if options.subscribe_events {
            if let Err(e) = session.enable_events().await {
                warn!(address, "could not enable server events: {}", e);
                self.teardown(Some(generation), "listen failed");
                return Err(e);
            }
        }

        self.complete_handshake(generation, handshake.clone())?;
        info!(
            address,
            version = %handshake.server_version,
            "handshake complete"
        );

        self.watch_session(generation, session);
        Ok(handshake)
    }

    /// Transition if this attempt is still current.
    fn advance(&self, generation: u64, state: ConnectionState) -> CliResult<()> {
        let mut cell = self.cell();
        if cell.generation != generation {
            return Err(CliError::SessionClosed);
        }
        debug!(from = %cell.state, to = %state, "connection state");
        cell.state = state;
        self.inner
            .bus
            .publish(BusEvent::ConnectionStateChanged { state });
        Ok(())
    }

    fn install_session(&self, generation: u64, session: Arc<ProtocolSession>) -> bool {
        let mut cell = self.cell();
        if cell.generation != generation {
            return false;
        }
        cell.session = Some(session);
        true
    }

    fn complete_handshake(&self, generation: u64, handshake: HandshakeResult) -> CliResult<()> {
        let mut cell = self.cell();
        if cell.generation != generation {
            return Err(CliError::SessionClosed);
        }
        cell.handshake = Some(handshake.clone());
        self.inner
            .bus
            .publish(BusEvent::HandshakeCompleted { handshake });
        Ok(())
    }

    /// Map a login failure to the right terminal state.
    ///
    /// A socket closed before the reply is a rejection (`LoginFailed`); a
    /// server that never answers is a timeout and ends the attempt.
    fn login_failed(&self, generation: u64, error: CliError) -> CliError {
        match error {
            CliError::Timeout { .. } => {
                warn!("login got no reply: {}", error);
                self.teardown(Some(generation), "login timeout");
                error
            }
            other => {
                let error = match other {
                    CliError::SessionClosed => CliError::AuthRejected,
                    other => other,
                };
                warn!("login failed: {}", error);
                let session = {
                    let mut cell = self.cell();
                    if cell.generation != generation {
                        return error;
                    }
                    cell.state = ConnectionState::LoginFailed;
                    self.inner.bus.publish(BusEvent::ConnectionStateChanged {
                        state: ConnectionState::LoginFailed,
                    });
                    cell.session.take()
                };
                if let Some(session) = session {
                    session.close();
                }
                error
            }
        }
    }

    /// Return to `Disconnected`.
    ///
    /// With `Some(generation)` only acts if that attempt is still current.
    /// Publishes `Disconnected` only when leaving another state.
    fn teardown(&self, generation: Option<u64>, reason: &str) {
        let (session, attempt) = {
            let mut cell = self.cell();
            if generation.is_some_and(|g| g != cell.generation) {
                return;
            }
            cell.generation += 1;
            if cell.state != ConnectionState::Disconnected {
                info!(from = %cell.state, reason, "disconnected");
                cell.state = ConnectionState::Disconnected;
                self.inner.bus.publish(BusEvent::ConnectionStateChanged {
                    state: ConnectionState::Disconnected,
                });
            }
            (cell.session.take(), cell.attempt.take())
        };

        if let Some(token) = attempt {
            token.cancel();
        }
        if let Some(session) = session {
            session.close();
        }
    }

    /// Drop to `Disconnected` when the server closes an established session.
    fn watch_session(&self, generation: u64, session: Arc<ProtocolSession>) {
        let machine = self.clone();
        tokio::spawn(async move {
            session.closed().await;
            machine.teardown(Some(generation), "server closed the session");
        });
    }
}

async fn login(session: &ProtocolSession, credentials: &Credentials) -> CliResult<()> {
    let command = match credentials.login_pair() {
        Some((username, password)) => Command::login(username, password),
        // Servers with authentication enabled drop the socket on any other
        // first command, so a cheap query doubles as the auth check.
        None => Command::new(["version", "?"]),
    };
    session.request(command).await.map(|_| ())
}

#[async_trait]
impl Requester for ConnectionStateMachine {
    /// Forward to the live session; errors go back to this caller only.
    async fn request(&self, command: Command) -> CliResult<Reply> {
        let session = self.session().ok_or(CliError::SessionClosed)?;
        session.request(command).await
    }
}
