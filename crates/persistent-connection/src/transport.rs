//! The transport capability consumed by the supervisor.
//!
//! A [`Connector`] builds one [`Transport`] per connection attempt. The
//! transport reports back through [`TransportEvents`], which tags every
//! event with the connection id so late events from a superseded transport
//! are recognised and dropped.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::Request;
use crate::types::RepoInfo;

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Diagnostic id, `"<client>:<n>"`.
    pub connection_id: String,
    pub repo: RepoInfo,
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
    /// Session id of the previous connection, as a resumption hint.
    pub last_session_id: Option<String>,
}

/// A live (or opening) connection.
pub trait Transport: Send {
    /// Queue a request frame. Only called after `on_ready`.
    fn send_request(&mut self, request: &Request);

    /// Tear the connection down. The supervisor ignores any event this
    /// transport reports afterwards.
    fn close(&mut self);
}

/// Factory for transports.
pub trait Connector: Send + Sync {
    fn connect(&self, params: ConnectParams, events: TransportEvents) -> Box<dyn Transport>;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransportEvent {
    Message(Value),
    Ready {
        server_timestamp_ms: i64,
        session_id: String,
    },
    Disconnect,
    Kill(String),
}

/// Callback surface handed to a transport.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    conn: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(conn: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { conn, tx }
    }

    fn emit(&self, event: TransportEvent) {
        if self.tx.send((self.conn, event)).is_err() {
            tracing::trace!(conn = self.conn, "supervisor gone, dropping transport event");
        }
    }

    /// A data frame arrived.
    pub fn on_message(&self, frame: Value) {
        self.emit(TransportEvent::Message(frame));
    }

    /// Handshake completed.
    pub fn on_ready(&self, server_timestamp_ms: i64, session_id: impl Into<String>) {
        self.emit(TransportEvent::Ready {
            server_timestamp_ms,
            session_id: session_id.into(),
        });
    }

    /// The connection is gone (closed locally, by the server, or by the network).
    pub fn on_disconnect(&self) {
        self.emit(TransportEvent::Disconnect);
    }

    /// The server asked the client not to reconnect.
    pub fn on_kill(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::Kill(reason.into()));
    }
}
