//! Connection supervisor: owns the transport lifecycle, the ledger, and
//! every reconnect decision. Runs on a single task; nothing here is shared.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::ack::Completion;
use crate::backoff::{Backoff, jitter_fraction};
use crate::ledger::{Ledger, OnDisconnectKind, Outbound, Route, WriteKind};
use crate::protocol::{self, Incoming, Request, ResponseBody, action, push, status};
use crate::tokens::{FetchedTokens, TokenCoordinator};
use crate::transport::{ConnectParams, Connector, Transport, TransportEvent, TransportEvents};
use crate::types::{
    AuthOverride, ClientConfig, ConnectionState, DisconnectReason, Event, HashFn, OpResult,
    OperationError, Query, RepoInfo,
};

/// Interrupt reason used when the server kills the connection.
pub(crate) const SERVER_KILL_INTERRUPT_REASON: &str = "server_kill";

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Requests from the facade.
pub(crate) enum Command {
    Listen {
        query: Query,
        tag: Option<u64>,
        hash_fn: HashFn,
        status_tx: mpsc::UnboundedSender<OpResult>,
    },
    Unlisten {
        query: Query,
        tag: Option<u64>,
    },
    Write {
        kind: WriteKind,
        path: String,
        data: Value,
        hash: Option<String>,
        completion: Completion,
    },
    OnDisconnect {
        kind: OnDisconnectKind,
        path: String,
        data: Value,
        completion: Completion,
    },
    Get {
        query: Query,
        completion: Completion,
    },
    ReportStats(Map<String, Value>),
    RefreshAuthToken(Option<String>),
    RefreshAppCheckToken(Option<String>),
    Interrupt(String),
    Resume(String),
}

/// Completions of work the supervisor spawned.
#[derive(Debug)]
pub(crate) enum Internal {
    TokensFetched { conn: u64, fetched: FetchedTokens },
}

// ---------------------------------------------------------------------------
// Outbound link
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Outbox {
    next_request_id: u64,
    pending: HashMap<u64, Route>,
}

/// A borrowed view of the live transport plus response bookkeeping.
struct Link<'a> {
    transport: &'a mut dyn Transport,
    outbox: &'a mut Outbox,
}

impl Outbound for Link<'_> {
    fn send(&mut self, action: &str, body: Value, route: Option<Route>) {
        self.outbox.next_request_id += 1;
        let id = self.outbox.next_request_id;
        let request = Request {
            id,
            action: action.to_string(),
            body,
        };
        tracing::debug!(id, action, body = %request.body, "send");
        self.transport.send_request(&request);
        if let Some(route) = route {
            self.outbox.pending.insert(id, route);
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

enum Phase {
    Idle,
    TimerPending {
        deadline: Instant,
    },
    /// `transport` is `None` while tokens are being fetched.
    Connecting {
        conn: u64,
        transport: Option<Box<dyn Transport>>,
    },
    Connected {
        conn: u64,
        transport: Box<dyn Transport>,
    },
}

pub(crate) struct Supervisor {
    id: u64,
    repo: RepoInfo,
    connector: Arc<dyn Connector>,
    auth_override: Option<AuthOverride>,
    forward_security_debug: bool,
    stats_key: String,

    phase: Phase,
    ledger: Ledger,
    tokens: TokenCoordinator,
    backoff: Backoff,
    outbox: Outbox,

    interrupt_reasons: BTreeSet<String>,
    online: bool,
    visible: bool,
    /// Some operation has asked for a connection.
    started: bool,
    first_connection: bool,
    next_conn: u64,
    last_session_id: Option<String>,

    events: mpsc::Sender<Event>,
    /// Status events waiting for room in `events`; at most one per kind.
    status_backlog: VecDeque<Event>,
    dropped_events: u64,
    state_tx: watch::Sender<ConnectionState>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl Supervisor {
    pub fn new(
        id: u64,
        config: ClientConfig,
        events: mpsc::Sender<Event>,
        state_tx: watch::Sender<ConnectionState>,
        transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let timing = config.timing.unwrap_or_default();
        let stats_key = format!(
            "sdk.{}.{}",
            config.sdk_client_name,
            config.sdk_version.replace('.', "-")
        );
        Self {
            id,
            repo: config.repo,
            connector: config.connector,
            auth_override: config.auth_override,
            forward_security_debug: config.forward_security_debug,
            stats_key,
            phase: Phase::Idle,
            ledger: Ledger::default(),
            tokens: TokenCoordinator::new(
                config.auth_provider,
                config.app_check_provider,
                timing.invalid_token_threshold,
            ),
            backoff: Backoff::new(timing),
            outbox: Outbox::default(),
            interrupt_reasons: BTreeSet::new(),
            online: true,
            visible: true,
            started: false,
            first_connection: true,
            next_conn: 0,
            last_session_id: None,
            events,
            status_backlog: VecDeque::new(),
            dropped_events: 0,
            state_tx,
            transport_tx,
            internal_tx,
        }
    }

    // --- small helpers -----------------------------------------------------

    fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected { .. })
    }

    fn current_conn(&self) -> Option<u64> {
        match self.phase {
            Phase::Connecting { conn, .. } | Phase::Connected { conn, .. } => Some(conn),
            Phase::Idle | Phase::TimerPending { .. } => None,
        }
    }

    fn has_connection(&self) -> bool {
        self.current_conn().is_some()
    }

    pub fn timer_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::TimerPending { deadline } => Some(deadline),
            _ => None,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        let public = match &phase {
            Phase::Idle => ConnectionState::Idle,
            Phase::TimerPending { .. } => ConnectionState::ConnectTimerPending,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected { .. } => ConnectionState::Connected,
        };
        self.phase = phase;
        self.state_tx.send_replace(public);
    }

    /// Data and security-debug events are dropped when the consumer falls
    /// behind; connect status and server info are held until there is room,
    /// keeping only the latest of each.
    fn emit(&mut self, event: Event) {
        match event {
            Event::ConnectStatus(_) | Event::ServerInfo { .. } => {
                let kind = std::mem::discriminant(&event);
                self.status_backlog.retain(|queued| std::mem::discriminant(queued) != kind);
                self.status_backlog.push_back(event);
                self.flush_status_backlog();
            }
            Event::DataUpdate { .. } | Event::SecurityDebug(_) => {
                // Keep order: nothing overtakes a held status event.
                self.flush_status_backlog();
                if !self.status_backlog.is_empty() {
                    self.drop_event();
                    return;
                }
                match self.events.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => self.drop_event(),
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
    }

    fn drop_event(&mut self) {
        self.dropped_events += 1;
        tracing::warn!(
            total_dropped = self.dropped_events,
            "event channel full, dropping event"
        );
    }

    fn flush_status_backlog(&mut self) {
        while let Some(event) = self.status_backlog.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.status_backlog.push_front(event);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.status_backlog.clear();
                    return;
                }
            }
        }
    }

    pub fn has_status_backlog(&self) -> bool {
        !self.status_backlog.is_empty()
    }

    pub fn discard_status_backlog(&mut self) {
        self.status_backlog.clear();
    }

    pub fn events_sender(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    /// Deliver the oldest held status event through a reserved slot.
    pub fn send_status_backlog(&mut self, permit: mpsc::Permit<'_, Event>) {
        if let Some(event) = self.status_backlog.pop_front() {
            permit.send(event);
        }
        self.flush_status_backlog();
    }

    fn should_reconnect(&self) -> bool {
        self.interrupt_reasons.is_empty() && self.online
    }

    fn link(&mut self) -> Option<(&mut Ledger, Link<'_>)> {
        match &mut self.phase {
            Phase::Connected { transport, .. } => Some((
                &mut self.ledger,
                Link {
                    transport: transport.as_mut(),
                    outbox: &mut self.outbox,
                },
            )),
            _ => None,
        }
    }

    fn send(&mut self, action: &str, body: Value, route: Option<Route>) {
        let link = self.link();
        assert!(
            link.is_some(),
            "sendRequest call when we're not connected not allowed."
        );
        if let Some((_, mut link)) = link {
            link.send(action, body, route);
        }
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    // --- commands ----------------------------------------------------------

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Listen {
                mut query,
                tag,
                hash_fn,
                status_tx,
            } => {
                query.path = protocol::normalize_path(&query.path);
                tracing::debug!(path = %query.path, query_id = %query.query_id, "Listen called");
                self.init_connection();
                let (path, query_id) = (query.path.clone(), query.query_id.clone());
                let registered = self.ledger.register_listen(query, tag, hash_fn, status_tx);
                assert!(
                    registered.is_ok(),
                    "listen() called twice for same path/queryId: {path} {query_id}"
                );
                if let Some((ledger, mut link)) = self.link() {
                    ledger.send_listen(&path, &query_id, &mut link);
                }
            }
            Command::Unlisten { query, tag } => {
                tracing::debug!(path = %query.path, query_id = %query.query_id, "Unlisten called");
                let removed = self.ledger.remove_listen(&query.path, &query.query_id);
                // Only tell the server about listens it could know of.
                if let Some(listen) = removed
                    && self.is_connected()
                {
                    tracing::debug!(path = %listen.query.path, "Unlisten");
                    let body = protocol::unlisten_body(
                        &listen.query.path,
                        &listen.query.query_object,
                        tag,
                    );
                    self.send(action::UNLISTEN, body, None);
                }
            }
            Command::Write {
                kind,
                path,
                data,
                hash,
                completion,
            } => {
                self.init_connection();
                let slot = self
                    .ledger
                    .enqueue_write(kind, path.clone(), data, hash, completion);
                match self.link() {
                    Some((ledger, mut link)) => ledger.send_write(slot, &mut link),
                    None => tracing::debug!(path = %path, "Buffering write"),
                }
            }
            Command::OnDisconnect {
                kind,
                path,
                data,
                completion,
            } => {
                self.init_connection();
                self.ledger.enqueue_on_disconnect(kind, path, data, completion);
                if let Some((ledger, mut link)) = self.link() {
                    ledger.drain_on_disconnect(&mut link);
                }
            }
            Command::Get { mut query, completion } => {
                query.path = protocol::normalize_path(&query.path);
                self.init_connection();
                let slot = self.ledger.enqueue_get(query, completion);
                if let Some((ledger, mut link)) = self.link() {
                    ledger.send_get(slot, &mut link);
                }
            }
            Command::ReportStats(counters) => self.report_stats(&counters),
            Command::RefreshAuthToken(token) => self.refresh_auth_token(token),
            Command::RefreshAppCheckToken(token) => self.refresh_app_check_token(token),
            Command::Interrupt(reason) => self.interrupt(reason),
            Command::Resume(reason) => self.resume(&reason),
        }
    }

    /// The first operation of the client's lifetime opens the connection.
    fn init_connection(&mut self) {
        if !self.started {
            self.started = true;
            if matches!(self.phase, Phase::Idle) {
                self.schedule_connect(Duration::ZERO);
            }
        }
    }

    fn report_stats(&mut self, counters: &Map<String, Value>) {
        // Stats are best effort: dropped while disconnected.
        if self.is_connected() {
            tracing::debug!(?counters, "reportStats");
            self.send(action::STATS, protocol::stats_body(counters), Some(Route::Stats));
        }
    }

    fn refresh_auth_token(&mut self, token: Option<String>) {
        tracing::debug!("Auth token refreshed");
        self.tokens.set_auth_token(token);
        match self.tokens.auth_token() {
            Some(token) => {
                if protocol::is_admin_credential(token) {
                    self.backoff.escalate_to_admin();
                }
                self.try_auth();
            }
            None => {
                // Drop the identity on the live socket; otherwise the
                // credential is simply not presented next time.
                if self.is_connected() {
                    self.send(action::UNAUTH, Value::Object(Map::new()), None);
                }
            }
        }
    }

    fn refresh_app_check_token(&mut self, token: Option<String>) {
        tracing::debug!("App check token refreshed");
        self.tokens.set_app_check_token(token);
        if self.tokens.app_check_token().is_some() {
            self.try_app_check();
        } else if self.is_connected() {
            self.send(action::UNAPP_CHECK, Value::Object(Map::new()), None);
        }
    }

    fn try_auth(&mut self) {
        if !self.is_connected() {
            return;
        }
        let Some(token) = self.tokens.auth_token().map(str::to_string) else {
            return;
        };
        let (action, body) = protocol::auth_request(&token, self.auth_override.as_ref());
        self.send(action, body, Some(Route::Auth { token }));
    }

    fn try_app_check(&mut self) {
        if !self.is_connected() {
            return;
        }
        let Some(token) = self.tokens.app_check_token().map(str::to_string) else {
            return;
        };
        self.send(
            action::APP_CHECK,
            protocol::app_check_body(&token),
            Some(Route::AppCheck { token }),
        );
    }

    pub fn interrupt(&mut self, reason: String) {
        if !self.interrupt_reasons.insert(reason.clone()) {
            return;
        }
        tracing::info!(reason = %reason, "Interrupting connection");
        match self.phase {
            Phase::Connecting { .. } | Phase::Connected { .. } => {
                self.close_connection(DisconnectReason::Interrupted);
            }
            Phase::TimerPending { .. } => self.set_phase(Phase::Idle),
            Phase::Idle => {}
        }
    }

    fn resume(&mut self, reason: &str) {
        tracing::info!(reason, "Resuming connection");
        self.interrupt_reasons.remove(reason);
        if self.interrupt_reasons.is_empty() {
            self.backoff.reset();
            if self.started && !self.has_connection() {
                self.schedule_connect(Duration::ZERO);
            }
        }
    }

    // --- connecting --------------------------------------------------------

    fn schedule_connect(&mut self, delay: Duration) {
        debug_assert!(
            !self.has_connection(),
            "Scheduling a connect when we're already connected/ing?"
        );
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Scheduling connect");
        self.set_phase(Phase::TimerPending {
            deadline: Instant::now() + delay,
        });
    }

    pub fn on_connect_timer(&mut self) {
        if !self.should_reconnect() {
            tracing::debug!("Connect timer fired but reconnecting is suppressed");
            self.set_phase(Phase::Idle);
            return;
        }
        tracing::info!("Making a connection attempt");
        self.backoff.record_attempt(Instant::now());
        self.next_conn += 1;
        let conn = self.next_conn;
        self.set_phase(Phase::Connecting {
            conn,
            transport: None,
        });

        let fetch = self.tokens.prepare_for_connect();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let fetched = fetch.await;
            let _ = tx.send(Internal::TokensFetched { conn, fetched });
        });
    }

    pub fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::TokensFetched { conn, fetched } => self.on_tokens_fetched(conn, fetched),
        }
    }

    fn on_tokens_fetched(&mut self, conn: u64, fetched: FetchedTokens) {
        let waiting = matches!(
            self.phase,
            Phase::Connecting { conn: c, transport: None } if c == conn
        );
        if !waiting {
            tracing::debug!(conn, "Token fetch completed but the attempt was canceled");
            return;
        }
        if let Err(e) = self.tokens.apply_fetched(fetched) {
            tracing::warn!(error = %e, "Failed to get token");
            self.on_transport_disconnect(DisconnectReason::TokenFailure);
            return;
        }
        if self
            .tokens
            .auth_token()
            .is_some_and(protocol::is_admin_credential)
        {
            self.backoff.escalate_to_admin();
        }

        tracing::debug!(conn, "Tokens ready, creating connection");
        let params = ConnectParams {
            connection_id: format!("{}:{}", self.id, conn),
            repo: self.repo.clone(),
            auth_token: self.tokens.auth_token().map(str::to_string),
            app_check_token: self.tokens.app_check_token().map(str::to_string),
            last_session_id: self.last_session_id.clone(),
        };
        let events = TransportEvents::new(conn, self.transport_tx.clone());
        let transport = self.connector.connect(params, events);
        self.phase = Phase::Connecting {
            conn,
            transport: Some(transport),
        };
    }

    // --- transport events --------------------------------------------------

    pub fn handle_transport_event(&mut self, conn: u64, event: TransportEvent) {
        if self.current_conn() != Some(conn) {
            tracing::trace!(conn, ?event, "Ignoring event from stale transport");
            return;
        }
        match event {
            TransportEvent::Ready {
                server_timestamp_ms,
                session_id,
            } => self.on_ready(server_timestamp_ms, session_id),
            TransportEvent::Message(frame) => {
                if self.is_connected() {
                    self.on_data_message(frame);
                } else {
                    tracing::debug!("Ignoring data frame before ready");
                }
            }
            TransportEvent::Disconnect => {
                tracing::info!(conn, "Data client disconnected");
                self.on_transport_disconnect(DisconnectReason::TransportClosed);
            }
            TransportEvent::Kill(reason) => {
                tracing::warn!("{reason} ({})", self.repo);
                self.interrupt(SERVER_KILL_INTERRUPT_REASON.to_string());
            }
        }
    }

    fn on_ready(&mut self, server_timestamp_ms: i64, session_id: String) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let (conn, transport) = match phase {
            Phase::Connecting {
                conn,
                transport: Some(transport),
            } => (conn, transport),
            other => {
                self.phase = other;
                tracing::debug!("Ignoring ready outside of a connect attempt");
                return;
            }
        };
        if !self.should_reconnect() {
            // Interrupted while the handshake was in flight.
            self.phase = Phase::Connecting {
                conn,
                transport: Some(transport),
            };
            self.close_connection(DisconnectReason::Interrupted);
            return;
        }

        tracing::info!(conn, "Connection ready");
        self.set_phase(Phase::Connected { conn, transport });
        self.backoff.record_established(Instant::now());
        self.emit(Event::ServerInfo {
            server_time_offset_ms: server_timestamp_ms - now_ms(),
        });
        self.last_session_id = Some(session_id);

        if self.first_connection {
            self.backoff.reset();
            self.send_connect_stats();
        }
        self.restore_state();
        self.first_connection = false;
        self.emit(Event::ConnectStatus(true));
    }

    fn send_connect_stats(&mut self) {
        let mut stats = Map::new();
        stats.insert(self.stats_key.clone(), Value::from(1));
        self.report_stats(&stats);
    }

    /// Re-authenticate, then replay the ledger.
    fn restore_state(&mut self) {
        self.try_auth();
        self.try_app_check();
        if let Some((ledger, mut link)) = self.link() {
            ledger.replay_all(&mut link);
        }
    }

    /// Close whatever transport exists and run disconnect handling.
    fn close_connection(&mut self, reason: DisconnectReason) {
        match &mut self.phase {
            Phase::Connecting {
                transport: Some(transport),
                ..
            }
            | Phase::Connected { transport, .. } => transport.close(),
            Phase::Connecting {
                transport: None, ..
            } => {}
            Phase::Idle | Phase::TimerPending { .. } => return,
        }
        self.on_transport_disconnect(reason);
    }

    fn on_transport_disconnect(&mut self, reason: DisconnectReason) {
        let was_connected = self.is_connected();
        self.phase = Phase::Idle;
        self.state_tx.send_replace(ConnectionState::Disconnected(reason));

        // Outcome of in-flight writes is unknowable: fail them, never retry.
        let failed = self.ledger.fail_sent_writes();
        // Remaining callbacks have unknown outcome; gets and listens stay in
        // the ledger and are replayed.
        self.outbox.pending.clear();
        tracing::info!(
            ?reason,
            failed_writes = failed,
            listens = self.ledger.listen_count(),
            writes = self.ledger.outstanding_writes(),
            on_disconnect = self.ledger.queued_on_disconnect(),
            gets = self.ledger.outstanding_gets(),
            "Disconnected"
        );

        if self.should_reconnect() {
            let delay = self.backoff.schedule_after_disconnect(
                Instant::now(),
                self.visible,
                jitter_fraction(),
            );
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                next_delay_ms = self.backoff.delay().as_millis() as u64,
                ceiling_ms = self.backoff.ceiling().as_millis() as u64,
                admin = self.backoff.is_admin(),
                "Trying to reconnect"
            );
            self.schedule_connect(delay);
        } else {
            self.set_phase(Phase::Idle);
        }
        if was_connected {
            self.emit(Event::ConnectStatus(false));
        }
    }

    // --- monitors ----------------------------------------------------------

    pub fn on_online(&mut self, online: bool) {
        self.online = online;
        if online {
            tracing::info!("Went online");
            self.backoff.reset();
            if self.started && !self.has_connection() {
                self.schedule_connect(Duration::ZERO);
            }
        } else {
            tracing::info!("Went offline, killing connection");
            self.close_connection(DisconnectReason::WentOffline);
        }
    }

    pub fn on_visible(&mut self, visible: bool) {
        if visible && !self.visible && self.backoff.on_visible() {
            tracing::info!("Became visible, reducing delay");
            if self.started && !self.has_connection() {
                self.schedule_connect(Duration::ZERO);
            }
        }
        self.visible = visible;
    }

    // --- inbound frames ----------------------------------------------------

    fn on_data_message(&mut self, frame: Value) {
        match protocol::decode_incoming(frame) {
            Incoming::Response { id, body } => {
                tracing::debug!(id, status = %body.status, "response");
                if let Some(route) = self.outbox.pending.remove(&id) {
                    self.on_response(route, body);
                }
            }
            Incoming::Push { action, body } => self.on_data_push(&action, body),
            Incoming::ServerError(err) => {
                tracing::error!("A server-side error has occurred: {err}");
            }
            Incoming::Unrecognized(frame) => {
                tracing::warn!(%frame, "Unrecognized frame from server");
            }
        }
    }

    fn on_response(&mut self, route: Route, body: ResponseBody) {
        match route {
            Route::Listen {
                path,
                query_id,
                serial,
            } => self.on_listen_response(&path, &query_id, serial, body),
            Route::Write { slot } => {
                self.ledger.ack_write(slot, op_result(body));
            }
            Route::OnDisconnect(completion) => completion.complete(op_result(body)),
            Route::Get { slot } => {
                self.ledger.ack_get(slot, op_result(body));
            }
            Route::Auth { token } => {
                // A response for a superseded token means nothing.
                if self.tokens.auth_token() != Some(token.as_str()) {
                    return;
                }
                if body.is_ok() {
                    self.tokens.on_auth_accepted();
                } else {
                    let explanation = body.data.as_str().unwrap_or("error").to_string();
                    self.on_auth_revoked(&body.status, &explanation);
                }
            }
            Route::AppCheck { token } => {
                if self.tokens.app_check_token() != Some(token.as_str()) {
                    return;
                }
                if body.is_ok() {
                    self.tokens.on_app_check_accepted();
                } else {
                    let explanation = body.data.as_str().unwrap_or("error").to_string();
                    self.on_app_check_revoked(&body.status, &explanation);
                }
            }
            Route::Stats => {
                if !body.is_ok() {
                    tracing::debug!(reason = %body.data, "Error sending stats");
                }
            }
        }
    }

    fn on_listen_response(&mut self, path: &str, query_id: &str, serial: u64, body: ResponseBody) {
        warn_on_listen_warnings(&body.data, path);
        // Only act if the listen was not removed (and maybe re-added) since.
        let current = self.ledger.listen(path, query_id).map(|l| l.serial);
        if current != Some(serial) {
            return;
        }
        tracing::debug!(path, query_id, status = %body.status, "listen response");
        if body.is_ok() {
            if let Some(listen) = self.ledger.listen(path, query_id) {
                listen.notify(Ok(body.data));
            }
        } else if let Some(listen) = self.ledger.remove_listen(path, query_id) {
            listen.notify(op_result(body));
        }
    }

    fn on_data_push(&mut self, push_action: &str, body: Value) {
        tracing::debug!(action = push_action, %body, "handleServerMessage");
        match push_action {
            push::DATA | push::MERGE => {
                let path = str_field(&body, "p").to_string();
                let data = body.get("d").cloned().unwrap_or(Value::Null);
                let tag = body.get("t").and_then(Value::as_u64);
                self.emit(Event::DataUpdate {
                    path,
                    data,
                    is_merge: push_action == push::MERGE,
                    tag,
                });
            }
            push::LISTEN_REVOKED => {
                let path = str_field(&body, "p");
                let query_id = protocol::query_id_from_revocation(body.get("q"));
                if let Some(listen) = self.ledger.remove_listen(path, &query_id) {
                    listen.notify(Err(OperationError::Server {
                        status: status::PERMISSION_DENIED.to_string(),
                        detail: Value::Null,
                    }));
                }
            }
            push::AUTH_REVOKED => {
                self.on_auth_revoked(str_field(&body, "s"), str_field(&body, "d"));
            }
            push::APP_CHECK_REVOKED => {
                self.on_app_check_revoked(str_field(&body, "s"), str_field(&body, "d"));
            }
            push::SECURITY_DEBUG => self.on_security_debug(body),
            other => {
                tracing::error!(
                    action = other,
                    "Unrecognized action received from server. Are you using the latest client?"
                );
            }
        }
    }

    /// Auth revocation is always connection-fatal.
    fn on_auth_revoked(&mut self, status_code: &str, explanation: &str) {
        let revocation = self.tokens.on_auth_revoked(status_code, explanation);
        if revocation.escalate {
            self.backoff.escalate_after_invalid_tokens();
        }
        self.close_connection(DisconnectReason::AuthRevoked);
    }

    fn on_app_check_revoked(&mut self, status_code: &str, explanation: &str) {
        let revocation = self.tokens.on_app_check_revoked(status_code, explanation);
        if revocation.escalate {
            self.backoff.escalate_after_invalid_tokens();
        }
    }

    fn on_security_debug(&mut self, body: Value) {
        if self.forward_security_debug {
            self.emit(Event::SecurityDebug(body));
        } else if let Some(msg) = body.get("msg").and_then(Value::as_str) {
            for line in msg.lines() {
                tracing::info!("security debug: {line}");
            }
        }
    }

    /// Permanent shutdown: close without reconnecting and abandon everything
    /// still outstanding.
    pub fn shutdown(&mut self) {
        tracing::info!("Shutting down");
        self.interrupt_reasons.insert("shutdown".to_string());
        self.close_connection(DisconnectReason::Shutdown);
        self.set_phase(Phase::Idle);
        self.ledger = Ledger::default();
    }
}

fn op_result(body: ResponseBody) -> OpResult {
    if body.is_ok() {
        Ok(body.data)
    } else {
        Err(OperationError::Server {
            status: body.status,
            detail: body.data,
        })
    }
}

fn str_field<'a>(body: &'a Value, key: &str) -> &'a str {
    body.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn has_no_index_warning(payload: &Value) -> bool {
    payload
        .get("w")
        .and_then(Value::as_array)
        .is_some_and(|w| w.iter().any(|v| v.as_str() == Some("no_index")))
}

fn warn_on_listen_warnings(payload: &Value, path: &str) {
    if has_no_index_warning(payload) {
        tracing::warn!(
            "Using an unspecified index. Your data will be downloaded and filtered on the \
             client. Consider adding an index at {path} to your security rules for better \
             performance."
        );
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

pub(crate) struct LoopChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub transport: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    pub internal: mpsc::UnboundedReceiver<Internal>,
    pub online: Option<watch::Receiver<bool>>,
    pub visible: Option<watch::Receiver<bool>>,
}

async fn next_signal(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

pub(crate) async fn run_event_loop(
    mut sup: Supervisor,
    mut ch: LoopChannels,
    mut close_rx: oneshot::Receiver<()>,
) {
    if let Some(rx) = ch.online.as_mut() {
        sup.set_online(*rx.borrow_and_update());
    }
    if let Some(rx) = ch.visible.as_mut() {
        sup.set_visible(*rx.borrow_and_update());
    }
    let events_tx = sup.events_sender();

    loop {
        let deadline = sup.timer_deadline();
        tokio::select! {
            _ = &mut close_rx => {
                sup.shutdown();
                return;
            }
            command = ch.commands.recv() => match command {
                Some(command) => sup.handle_command(command),
                None => {
                    sup.shutdown();
                    return;
                }
            },
            Some((conn, event)) = ch.transport.recv() => sup.handle_transport_event(conn, event),
            Some(internal) = ch.internal.recv() => sup.handle_internal(internal),
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                sup.on_connect_timer();
            }
            online = next_signal(&mut ch.online) => match online {
                Some(online) => sup.on_online(online),
                None => ch.online = None,
            },
            visible = next_signal(&mut ch.visible) => match visible {
                Some(visible) => sup.on_visible(visible),
                None => ch.visible = None,
            },
            permit = events_tx.reserve(), if sup.has_status_backlog() => match permit {
                Ok(permit) => sup.send_status_backlog(permit),
                // Nobody is listening any more.
                Err(_) => sup.discard_status_backlog(),
            },
        }
    }
    // Monitor receivers drop with `ch`: that is the unsubscribe.
}
