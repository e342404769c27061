//! Persistent realtime connection client for a document-sync backend.
//!
//! Keeps one long-lived connection to the server and multiplexes
//! application operations over it: listens, writes, on-disconnect actions,
//! one-off reads and stats. Disconnects, auth expiry and network flakiness
//! are recovered from transparently.
//!
//! # Features
//! - Lazy connect on the first operation
//! - Reconnect with multiplicative backoff (1s floor, 5m ceiling, 30s for
//!   administrative credentials)
//! - Replay of every outstanding operation after each reconnect
//! - Exactly-once completion for writes, gets and on-disconnect actions
//! - Concurrent auth and app-check token fetch before each attempt
//! - Online/visibility awareness through injected monitors
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use persistent_connection::{
//!     BoxError, ClientConfig, PersistentConnection, Query, RepoInfo, TokenProvider,
//!     WebSocketConnector,
//! };
//!
//! struct NoAuth;
//!
//! #[async_trait]
//! impl TokenProvider for NoAuth {
//!     async fn get_token(&self, _force_refresh: bool) -> Result<Option<String>, BoxError> {
//!         Ok(None)
//!     }
//! }
//!
//! let config = ClientConfig::new(
//!     RepoInfo::new("my-db.example.com", "my-db"),
//!     Arc::new(WebSocketConnector::default()),
//!     Arc::new(NoAuth),
//! );
//! let mut client = PersistentConnection::new(config);
//!
//! let mut status = client.listen(Query::default_at("/messages"), || String::new(), None);
//! client.put("/messages/1", serde_json::json!({"text": "hi"}), None).await?;
//! status.next().await;
//! while let Some(event) = client.next_event().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod ack;
mod backoff;
mod client;
mod ledger;
mod monitor;
pub mod protocol;
mod supervisor;
mod tokens;
mod transport;
mod types;
mod websocket;

pub use ack::Ack;
pub use backoff::next_delay;
pub use client::{ListenStatus, PersistentConnection};
pub use ledger::LedgerError;
pub use monitor::{SignalMonitor, StateMonitor};
pub use protocol::Request;
pub use tokens::{TokenListener, TokenProvider};
pub use transport::{ConnectParams, Connector, Transport, TransportEvents};
pub use types::{
    AuthOverride, BoxError, ClientConfig, ConnectionState, DisconnectReason, Error, Event, HashFn,
    OpResult, OperationError, PROTOCOL_VERSION, Query, RepoInfo, TimingConfig,
};
pub use websocket::WebSocketConnector;
