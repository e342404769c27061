//! Public types for the persistent-connection crate.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::monitor::StateMonitor;
use crate::tokens::TokenProvider;
use crate::transport::Connector;

/// A boxed error type for token providers and transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Computes a content hash of locally cached state for a listen. Evaluated
/// every time the listen is (re)sent.
pub type HashFn = Box<dyn Fn() -> String + Send>;

/// Outcome of a single operation: the server's payload, or why it failed.
pub type OpResult = Result<Value, OperationError>;

/// Wire protocol version advertised in the connection URL.
pub const PROTOCOL_VERSION: &str = "5";

/// Location of the backend the client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    /// Host (and optional port), e.g. `"my-db.example.com"`.
    pub host: String,
    /// Database namespace sent as the `ns` URL parameter.
    pub namespace: String,
    /// `wss` when true, `ws` otherwise.
    pub secure: bool,
}

impl RepoInfo {
    pub fn new(host: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            secure: true,
        }
    }

    /// Emulator hosts have no meaningful online signal.
    pub fn is_local(&self) -> bool {
        self.host.contains("fblocal")
    }

    /// WebSocket URL for a connection, optionally hinting the previous session.
    pub fn connection_url(&self, last_session_id: Option<&str>) -> Result<url::Url, Error> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut u = url::Url::parse(&format!("{scheme}://{}/.ws", self.host))?;
        {
            let mut q = u.query_pairs_mut();
            q.append_pair("v", PROTOCOL_VERSION);
            q.append_pair("ns", &self.namespace);
            if let Some(session) = last_session_id {
                q.append_pair("ls", session);
            }
        }
        Ok(u)
    }
}

impl std::fmt::Display for RepoInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.host)
    }
}

/// An opaque query descriptor: the path it targets, its identity among the
/// queries at that path, and the object sent to the server for non-default
/// queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub path: String,
    pub query_id: String,
    pub query_object: Value,
}

impl Query {
    /// The default (load everything) query at `path`.
    pub fn default_at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query_id: crate::protocol::DEFAULT_QUERY_ID.to_string(),
            query_object: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn new(path: impl Into<String>, query_id: impl Into<String>, query_object: Value) -> Self {
        Self {
            path: path.into(),
            query_id: query_id.into(),
            query_object,
        }
    }
}

/// Replaces the identity the server derives from the credential.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOverride {
    /// Act unauthenticated (`noauth: true`).
    Anonymous,
    /// Act with these auth variables (`authvar`).
    Claims(Value),
}

/// Events emitted by a [`PersistentConnection`](crate::PersistentConnection).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Data pushed by the server for a listened location.
    DataUpdate {
        path: String,
        data: Value,
        is_merge: bool,
        tag: Option<u64>,
    },
    /// The connection became ready (`true`) or was lost (`false`).
    ConnectStatus(bool),
    /// Server clock skew, `server - local`, in milliseconds.
    ServerInfo { server_time_offset_ms: i64 },
    /// A security rules debug packet (only when forwarding is enabled).
    SecurityDebug(Value),
}

/// Why the last connection (or connection attempt) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The auth token fetch failed before a transport was created.
    TokenFailure,
    /// The transport closed or failed.
    TransportClosed,
    /// The server revoked the auth credential.
    AuthRevoked,
    /// `interrupt` was called (or the server killed the connection).
    Interrupted,
    /// The online monitor reported offline.
    WentOffline,
    /// The client is shutting down.
    Shutdown,
}

/// Observable lifecycle of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt scheduled.
    Idle,
    /// A connect attempt is scheduled.
    ConnectTimerPending,
    /// Fetching tokens or waiting for the transport handshake.
    Connecting,
    Connected,
    /// Transient: the supervisor is deciding whether to reconnect.
    Disconnected(DisconnectReason),
}

/// Reconnect and credential timing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingConfig {
    /// Floor for the reconnect delay.
    pub min_reconnect_delay: Duration,
    /// Ceiling for ordinary credentials.
    pub max_reconnect_delay: Duration,
    /// Ceiling once an administrative credential has been seen.
    pub admin_max_reconnect_delay: Duration,
    pub reconnect_multiplier: f64,
    /// A connection that lived at least this long resets the delay to the floor.
    pub reset_after_connected_for: Duration,
    /// Consecutive `invalid_token`/`permission_denied` revocations before
    /// escalating.
    pub invalid_token_threshold: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(5 * 60),
            admin_max_reconnect_delay: Duration::from_secs(30),
            reconnect_multiplier: 1.3,
            reset_after_connected_for: Duration::from_secs(30),
            invalid_token_threshold: 3,
        }
    }
}

/// Configuration for [`PersistentConnection::new`](crate::PersistentConnection::new).
pub struct ClientConfig {
    pub repo: RepoInfo,
    /// Creates the underlying transport for each connection attempt.
    pub connector: Arc<dyn Connector>,
    pub auth_provider: Arc<dyn TokenProvider>,
    pub app_check_provider: Option<Arc<dyn TokenProvider>>,
    pub auth_override: Option<AuthOverride>,
    /// Absent means always online.
    pub online_monitor: Option<Arc<dyn StateMonitor>>,
    /// Absent means always visible.
    pub visibility_monitor: Option<Arc<dyn StateMonitor>>,
    /// Emit `sd` packets as [`Event::SecurityDebug`] instead of logging them.
    pub forward_security_debug: bool,
    /// Client name used in the first-connection stats key.
    pub sdk_client_name: String,
    pub sdk_version: String,
    pub timing: Option<TimingConfig>,
}

impl ClientConfig {
    pub fn new(
        repo: RepoInfo,
        connector: Arc<dyn Connector>,
        auth_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            repo,
            connector,
            auth_provider,
            app_check_provider: None,
            auth_override: None,
            online_monitor: None,
            visibility_monitor: None,
            forward_security_debug: false,
            sdk_client_name: "rust".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            timing: None,
        }
    }
}

/// Failure of a single operation, delivered only to that operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperationError {
    #[error("server rejected operation: {status}")]
    Server { status: String, detail: Value },

    /// The write was sent but the connection dropped before the server
    /// acknowledged it; its effect is unknown.
    #[error("connection dropped before the write was acknowledged")]
    Disconnected,

    #[error("operation abandoned before the server answered")]
    Abandoned,
}

impl OperationError {
    pub fn status(&self) -> &str {
        match self {
            OperationError::Server { status, .. } => status,
            OperationError::Disconnected => crate::protocol::status::DISCONNECT,
            OperationError::Abandoned => "abandoned",
        }
    }
}

/// Errors returned by this crate's transports and setup paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Token fetch failed: {0}")]
    TokenFetch(BoxError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
