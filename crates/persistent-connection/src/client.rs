//! Public entry point: [`PersistentConnection`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::ack::{Ack, ack_pair};
use crate::ledger::{OnDisconnectKind, WriteKind};
use crate::supervisor::{
    Command, EVENT_CHANNEL_CAPACITY, LoopChannels, Supervisor, run_event_loop,
};
use crate::types::{ClientConfig, ConnectionState, Event, OpResult, Query};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Responses to a listen: one item per server answer (each replay is
/// answered again) and a final error item if the listen is rejected or
/// revoked.
#[derive(Debug)]
pub struct ListenStatus {
    rx: mpsc::UnboundedReceiver<OpResult>,
}

impl ListenStatus {
    /// Wait for the next response. `None` once the listen is gone and every
    /// response has been read.
    pub async fn next(&mut self) -> Option<OpResult> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<OpResult> {
        self.rx.try_recv().ok()
    }
}

/// Handle to a persistent connection.
///
/// Every method returns immediately; the connection itself is driven by a
/// background task that connects lazily on the first operation, reconnects
/// with backoff, and replays outstanding work after each reconnect.
///
/// Dropping the handle (or calling [`close`](PersistentConnection::close))
/// shuts the connection down for good. Outstanding [`Ack`]s then resolve to
/// [`OperationError::Abandoned`](crate::OperationError::Abandoned).
pub struct PersistentConnection {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    close_tx: Option<oneshot::Sender<()>>,
    events_rx: mpsc::Receiver<Event>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl PersistentConnection {
    /// Create a client and spawn its event loop. Must be called from within
    /// a tokio runtime. No connection is made until the first operation.
    pub fn new(config: ClientConfig) -> Self {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (transport_tx, transport) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (close_tx, close_rx) = oneshot::channel();

        // Providers only hold weak senders so they never keep the loop alive.
        let weak = cmd_tx.downgrade();
        config
            .auth_provider
            .add_token_change_listener(Box::new(move |token| {
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.send(Command::RefreshAuthToken(token));
                }
            }));
        if let Some(provider) = &config.app_check_provider {
            let weak = cmd_tx.downgrade();
            provider.add_token_change_listener(Box::new(move |token| {
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.send(Command::RefreshAppCheckToken(token));
                }
            }));
        }

        let online = if config.repo.is_local() {
            None
        } else {
            config.online_monitor.as_ref().map(|m| m.subscribe())
        };
        let visible = config.visibility_monitor.as_ref().map(|m| m.subscribe());

        let span = tracing::info_span!("persistent_connection", conn = %format!("p:{id}"));
        let supervisor =
            Supervisor::new(id, config, events_tx, state_tx, transport_tx, internal_tx);
        tokio::spawn(
            run_event_loop(
                supervisor,
                LoopChannels {
                    commands,
                    transport,
                    internal,
                    online,
                    visible,
                },
                close_rx,
            )
            .instrument(span),
        );

        Self {
            id,
            cmd_tx,
            close_tx: Some(close_tx),
            events_rx,
            state_rx,
        }
    }

    /// Process-unique id of this client, as used in log fields.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn command(&self, command: Command) {
        if self.cmd_tx.send(command).is_err() {
            tracing::debug!(client = self.id, "event loop gone, dropping command");
        }
    }

    /// Subscribe to `query`. `hash_fn` is evaluated each time the listen is
    /// sent so the server can skip data the client already has.
    ///
    /// # Panics
    ///
    /// The event loop panics if `query` is already being listened to.
    pub fn listen(
        &self,
        query: Query,
        hash_fn: impl Fn() -> String + Send + 'static,
        tag: Option<u64>,
    ) -> ListenStatus {
        let (status_tx, rx) = mpsc::unbounded_channel();
        self.command(Command::Listen {
            query,
            tag,
            hash_fn: Box::new(hash_fn),
            status_tx,
        });
        ListenStatus { rx }
    }

    pub fn unlisten(&self, query: Query, tag: Option<u64>) {
        self.command(Command::Unlisten { query, tag });
    }

    /// Overwrite the data at `path`. With `hash`, the server only applies the
    /// write if its current data hashes to that value.
    pub fn put(&self, path: &str, data: Value, hash: Option<String>) -> Ack {
        self.write(WriteKind::Put, path, data, hash)
    }

    /// Update the children of `path` named in `data`.
    pub fn merge(&self, path: &str, data: Value, hash: Option<String>) -> Ack {
        self.write(WriteKind::Merge, path, data, hash)
    }

    fn write(&self, kind: WriteKind, path: &str, data: Value, hash: Option<String>) -> Ack {
        let (completion, ack) = ack_pair();
        self.command(Command::Write {
            kind,
            path: path.to_string(),
            data,
            hash,
            completion,
        });
        ack
    }

    /// Have the server write `data` at `path` once this client disconnects.
    pub fn on_disconnect_put(&self, path: &str, data: Value) -> Ack {
        self.on_disconnect(OnDisconnectKind::Put, path, data)
    }

    pub fn on_disconnect_merge(&self, path: &str, data: Value) -> Ack {
        self.on_disconnect(OnDisconnectKind::Merge, path, data)
    }

    /// Cancel every on-disconnect write registered at or below `path`.
    pub fn on_disconnect_cancel(&self, path: &str) -> Ack {
        self.on_disconnect(OnDisconnectKind::Cancel, path, Value::Null)
    }

    fn on_disconnect(&self, kind: OnDisconnectKind, path: &str, data: Value) -> Ack {
        let (completion, ack) = ack_pair();
        self.command(Command::OnDisconnect {
            kind,
            path: path.to_string(),
            data,
            completion,
        });
        ack
    }

    /// One-off read of `query`.
    pub fn get(&self, query: Query) -> Ack {
        let (completion, ack) = ack_pair();
        self.command(Command::Get { query, completion });
        ack
    }

    /// Best effort: dropped unless currently connected.
    pub fn report_stats(&self, counters: Map<String, Value>) {
        self.command(Command::ReportStats(counters));
    }

    /// Replace the cached auth token and re-authenticate the live socket.
    /// `None` (or an empty token) drops the identity without reconnecting.
    pub fn refresh_auth_token(&self, token: Option<String>) {
        self.command(Command::RefreshAuthToken(token));
    }

    pub fn refresh_app_check_token(&self, token: Option<String>) {
        self.command(Command::RefreshAppCheckToken(token));
    }

    /// Close the connection and stay disconnected until every interrupt
    /// reason has been resumed. Interrupting twice for the same reason is a
    /// no-op.
    pub fn interrupt(&self, reason: &str) {
        self.command(Command::Interrupt(reason.to_string()));
    }

    pub fn resume(&self, reason: &str) {
        self.command(Command::Resume(reason.to_string()));
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every published state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Receive the next event. Returns `None` once the event loop has exited.
    ///
    /// Events are buffered up to a fixed capacity. A consumer that falls
    /// behind loses data updates; the latest connect status and server info
    /// are kept until read.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<Event> {
        self.events_rx.try_recv().ok()
    }

    /// Shut down: close the connection and never reconnect.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PersistentConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("id", &self.id)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}
