//! In-memory record of every operation the server has not yet acknowledged,
//! and the replay of that record onto a fresh connection.

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::ack::Completion;
use crate::protocol::{self, action};
use crate::types::{HashFn, OpResult, OperationError, Query};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("listen() called twice for same path/queryId: {path} {query_id}")]
    DuplicateListen { path: String, query_id: String },
}

/// Where a response frame goes once it arrives.
#[derive(Debug)]
pub(crate) enum Route {
    Listen {
        path: String,
        query_id: String,
        serial: u64,
    },
    Write {
        slot: usize,
    },
    OnDisconnect(Completion),
    Get {
        slot: usize,
    },
    Auth {
        token: String,
    },
    AppCheck {
        token: String,
    },
    Stats,
}

/// Sink for outbound requests; implemented by the supervisor's live
/// connection.
pub(crate) trait Outbound {
    fn send(&mut self, action: &str, body: Value, route: Option<Route>);
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

pub(crate) struct ListenRegistration {
    /// Distinguishes a registration from a later one under the same key.
    pub serial: u64,
    pub query: Query,
    pub tag: Option<u64>,
    pub hash_fn: HashFn,
    pub status_tx: mpsc::UnboundedSender<OpResult>,
}

impl ListenRegistration {
    pub fn notify(&self, result: OpResult) {
        let _ = self.status_tx.send(result);
    }
}

impl std::fmt::Debug for ListenRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenRegistration")
            .field("serial", &self.serial)
            .field("query", &self.query)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Put,
    Merge,
}

#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub kind: WriteKind,
    pub path: String,
    pub data: Value,
    pub hash: Option<String>,
    pub completion: Completion,
    /// Transmitted on the current connection.
    pub sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnDisconnectKind {
    Put,
    Merge,
    Cancel,
}

#[derive(Debug)]
pub(crate) struct OnDisconnectAction {
    pub kind: OnDisconnectKind,
    pub path: String,
    /// `Null` for cancel.
    pub data: Value,
    pub completion: Completion,
}

#[derive(Debug)]
pub(crate) struct PendingGet {
    pub query: Query,
    pub completion: Completion,
}

/// Append-only slots with tombstones. The backing vector is cleared only
/// when nothing is outstanding, so in-flight slot numbers stay valid.
#[derive(Debug)]
pub(crate) struct Slots<T> {
    items: Vec<Option<T>>,
    outstanding: usize,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            outstanding: 0,
        }
    }
}

impl<T> Slots<T> {
    pub fn push(&mut self, item: T) -> usize {
        self.items.push(Some(item));
        self.outstanding += 1;
        self.items.len() - 1
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.items.get_mut(slot).and_then(Option::as_mut)
    }

    /// Tombstone a slot, returning its item if it was still live.
    pub fn take(&mut self, slot: usize) -> Option<T> {
        let item = self.items.get_mut(slot).and_then(Option::take)?;
        self.outstanding -= 1;
        if self.outstanding == 0 {
            self.items.clear();
        }
        Some(item)
    }

    pub fn live_slots(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_ref().map(|_| i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.outstanding
    }

    #[cfg(test)]
    pub fn capacity_used(&self) -> usize {
        self.items.len()
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    listens: BTreeMap<String, BTreeMap<String, ListenRegistration>>,
    next_listen_serial: u64,
    writes: Slots<PendingWrite>,
    on_disconnect: VecDeque<OnDisconnectAction>,
    gets: Slots<PendingGet>,
}

impl Ledger {
    // --- listens -----------------------------------------------------------

    /// Record a listen. `query.path` must already be normalized.
    pub fn register_listen(
        &mut self,
        query: Query,
        tag: Option<u64>,
        hash_fn: HashFn,
        status_tx: mpsc::UnboundedSender<OpResult>,
    ) -> Result<u64, LedgerError> {
        let by_query = self.listens.entry(query.path.clone()).or_default();
        if by_query.contains_key(&query.query_id) {
            return Err(LedgerError::DuplicateListen {
                path: query.path,
                query_id: query.query_id,
            });
        }
        self.next_listen_serial += 1;
        let serial = self.next_listen_serial;
        by_query.insert(
            query.query_id.clone(),
            ListenRegistration {
                serial,
                query,
                tag,
                hash_fn,
                status_tx,
            },
        );
        Ok(serial)
    }

    pub fn remove_listen(&mut self, path: &str, query_id: &str) -> Option<ListenRegistration> {
        let path = protocol::normalize_path(path);
        let by_query = self.listens.get_mut(&path)?;
        let removed = by_query.remove(query_id);
        if by_query.is_empty() {
            self.listens.remove(&path);
        }
        removed
    }

    pub fn listen(&self, path: &str, query_id: &str) -> Option<&ListenRegistration> {
        self.listens.get(path)?.get(query_id)
    }

    pub fn listen_count(&self) -> usize {
        self.listens.values().map(BTreeMap::len).sum()
    }

    pub fn send_listen(&self, path: &str, query_id: &str, out: &mut impl Outbound) {
        let Some(listen) = self.listen(path, query_id) else {
            return;
        };
        tracing::debug!(path, query_id, "Listen");
        // Hash is computed now: local state may have changed since registration.
        let body = protocol::listen_body(
            &listen.query.path,
            &listen.query.query_object,
            listen.tag,
            (listen.hash_fn)(),
        );
        out.send(
            action::LISTEN,
            body,
            Some(Route::Listen {
                path: listen.query.path.clone(),
                query_id: listen.query.query_id.clone(),
                serial: listen.serial,
            }),
        );
    }

    // --- writes ------------------------------------------------------------

    pub fn enqueue_write(
        &mut self,
        kind: WriteKind,
        path: String,
        data: Value,
        hash: Option<String>,
        completion: Completion,
    ) -> usize {
        self.writes.push(PendingWrite {
            kind,
            path,
            data,
            hash,
            completion,
            sent: false,
        })
    }

    pub fn send_write(&mut self, slot: usize, out: &mut impl Outbound) {
        let Some(write) = self.writes.get_mut(slot) else {
            return;
        };
        write.sent = true;
        let action = match write.kind {
            WriteKind::Put => action::PUT,
            WriteKind::Merge => action::MERGE,
        };
        let body = protocol::write_body(&write.path, &write.data, write.hash.as_deref());
        out.send(action, body, Some(Route::Write { slot }));
    }

    /// Deliver a write's outcome. Returns false if the slot was already
    /// tombstoned (e.g. by disconnect synthesis).
    pub fn ack_write(&mut self, slot: usize, result: OpResult) -> bool {
        match self.writes.take(slot) {
            Some(write) => {
                write.completion.complete(result);
                true
            }
            None => false,
        }
    }

    /// The connection dropped: every write transmitted on it completes with
    /// `Disconnected` and is not retried. Returns how many were failed.
    pub fn fail_sent_writes(&mut self) -> usize {
        let mut failed = 0;
        for slot in self.writes.live_slots() {
            let sent = self.writes.get_mut(slot).is_some_and(|w| w.sent);
            if sent && let Some(write) = self.writes.take(slot) {
                write.completion.complete(Err(OperationError::Disconnected));
                failed += 1;
            }
        }
        failed
    }

    pub fn outstanding_writes(&self) -> usize {
        self.writes.len()
    }

    // --- on-disconnect -----------------------------------------------------

    pub fn enqueue_on_disconnect(
        &mut self,
        kind: OnDisconnectKind,
        path: String,
        data: Value,
        completion: Completion,
    ) {
        self.on_disconnect.push_back(OnDisconnectAction {
            kind,
            path,
            data,
            completion,
        });
    }

    /// Transmit and forget every queued on-disconnect action, oldest first.
    pub fn drain_on_disconnect(&mut self, out: &mut impl Outbound) {
        while let Some(request) = self.on_disconnect.pop_front() {
            let action = match request.kind {
                OnDisconnectKind::Put => action::ON_DISCONNECT_PUT,
                OnDisconnectKind::Merge => action::ON_DISCONNECT_MERGE,
                OnDisconnectKind::Cancel => action::ON_DISCONNECT_CANCEL,
            };
            tracing::debug!(action, path = %request.path, "onDisconnect");
            let body = protocol::on_disconnect_body(&request.path, &request.data);
            out.send(action, body, Some(Route::OnDisconnect(request.completion)));
        }
    }

    pub fn queued_on_disconnect(&self) -> usize {
        self.on_disconnect.len()
    }

    // --- gets --------------------------------------------------------------

    pub fn enqueue_get(&mut self, query: Query, completion: Completion) -> usize {
        self.gets.push(PendingGet { query, completion })
    }

    pub fn send_get(&mut self, slot: usize, out: &mut impl Outbound) {
        let Some(get) = self.gets.get_mut(slot) else {
            return;
        };
        let body = protocol::get_body(&get.query.path, &get.query.query_object);
        out.send(action::GET, body, Some(Route::Get { slot }));
    }

    pub fn ack_get(&mut self, slot: usize, result: OpResult) -> bool {
        match self.gets.take(slot) {
            Some(get) => {
                get.completion.complete(result);
                true
            }
            None => false,
        }
    }

    pub fn outstanding_gets(&self) -> usize {
        self.gets.len()
    }

    // --- replay ------------------------------------------------------------

    /// Send everything outstanding onto a connection that just became ready:
    /// listens, then writes in slot order, then on-disconnect actions in FIFO
    /// order, then gets in slot order.
    pub fn replay_all(&mut self, out: &mut impl Outbound) {
        // Writes depend on their listens' data arriving first.
        let keys: Vec<(String, String)> = self
            .listens
            .iter()
            .flat_map(|(path, by_query)| by_query.keys().map(move |q| (path.clone(), q.clone())))
            .collect();
        for (path, query_id) in &keys {
            self.send_listen(path, query_id, out);
        }

        for slot in self.writes.live_slots() {
            self.send_write(slot, out);
        }

        self.drain_on_disconnect(out);

        for slot in self.gets.live_slots() {
            self.send_get(slot, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::{Ack, ack_pair};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(String, Value)>,
        routes: Vec<Option<Route>>,
    }

    impl Outbound for Recorder {
        fn send(&mut self, action: &str, body: Value, route: Option<Route>) {
            self.sent.push((action.to_string(), body));
            self.routes.push(route);
        }
    }

    impl Recorder {
        fn actions(&self) -> Vec<&str> {
            self.sent.iter().map(|(a, _)| a.as_str()).collect()
        }
    }

    fn listen(
        ledger: &mut Ledger,
        path: &str,
        hash: &'static str,
    ) -> mpsc::UnboundedReceiver<OpResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        let hash_fn: HashFn = Box::new(move || hash.to_string());
        ledger
            .register_listen(Query::default_at(path), None, hash_fn, tx)
            .unwrap();
        rx
    }

    fn put(ledger: &mut Ledger, path: &str) -> (usize, Ack) {
        let (completion, ack) = ack_pair();
        let slot =
            ledger.enqueue_write(WriteKind::Put, path.to_string(), json!(1), None, completion);
        (slot, ack)
    }

    #[test]
    fn duplicate_listen_rejected() {
        let mut ledger = Ledger::default();
        let _rx = listen(&mut ledger, "/a", "h");
        let (tx, _rx2) = mpsc::unbounded_channel();
        let err = ledger
            .register_listen(Query::default_at("/a"), None, Box::new(String::new), tx)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::DuplicateListen {
                path: "/a".into(),
                query_id: "default".into()
            }
        );
    }

    #[test]
    fn remove_listen_is_no_op_safe() {
        let mut ledger = Ledger::default();
        assert!(ledger.remove_listen("/nothing", "default").is_none());
        let _rx = listen(&mut ledger, "/a", "h");
        assert!(ledger.remove_listen("a/", "default").is_some());
        assert!(ledger.remove_listen("/a", "default").is_none());
        assert_eq!(ledger.listen_count(), 0);
    }

    #[test]
    fn reregistered_listen_gets_new_serial() {
        let mut ledger = Ledger::default();
        let _rx = listen(&mut ledger, "/a", "h");
        let first = ledger.listen("/a", "default").unwrap().serial;
        ledger.remove_listen("/a", "default");
        let _rx = listen(&mut ledger, "/a", "h");
        assert_ne!(ledger.listen("/a", "default").unwrap().serial, first);
    }

    #[test]
    fn write_ack_fires_once_and_compacts() {
        let mut ledger = Ledger::default();
        let (s0, mut a0) = put(&mut ledger, "/x");
        let (s1, _a1) = put(&mut ledger, "/y");
        assert!(ledger.ack_write(s0, Ok(Value::Null)));
        assert!(!ledger.ack_write(s0, Ok(Value::Null)));
        assert_eq!(a0.try_result(), Some(Ok(Value::Null)));
        // Slot indices stay stable while anything is outstanding.
        assert_eq!(ledger.writes.capacity_used(), 2);
        assert!(ledger.ack_write(s1, Ok(Value::Null)));
        assert_eq!(ledger.writes.capacity_used(), 0);
    }

    #[test]
    fn disconnect_fails_only_sent_writes() {
        let mut ledger = Ledger::default();
        let (s0, mut a0) = put(&mut ledger, "/x");
        let (_s1, mut a1) = put(&mut ledger, "/y");
        let mut out = Recorder::default();
        ledger.send_write(s0, &mut out);

        assert_eq!(ledger.fail_sent_writes(), 1);
        assert_eq!(a0.try_result(), Some(Err(OperationError::Disconnected)));
        assert!(a1.try_result().is_none());
        // A late server ack for the failed write is swallowed.
        assert!(!ledger.ack_write(s0, Ok(Value::Null)));
        assert_eq!(ledger.outstanding_writes(), 1);
    }

    #[test]
    fn replay_order_and_fresh_hash() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let mut ledger = Ledger::default();
        let (c, _get_ack) = ack_pair();
        ledger.enqueue_get(Query::default_at("/g"), c);
        let (_s, _put_ack) = put(&mut ledger, "/x");
        let (c, _od_ack) = ack_pair();
        ledger.enqueue_on_disconnect(OnDisconnectKind::Cancel, "/o".into(), Value::Null, c);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (tx, _rx) = mpsc::unbounded_channel();
        ledger
            .register_listen(
                Query::default_at("/a"),
                None,
                Box::new(move || format!("h{}", counter.fetch_add(1, Ordering::SeqCst))),
                tx,
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut out = Recorder::default();
        ledger.replay_all(&mut out);
        assert_eq!(out.actions(), vec!["q", "p", "oc", "g"]);
        assert_eq!(out.sent[0].1, json!({"p": "/a", "h": "h0"}));

        let mut out = Recorder::default();
        ledger.replay_all(&mut out);
        // On-disconnect actions are not re-queued once transmitted.
        assert_eq!(out.actions(), vec!["q", "p", "g"]);
        assert_eq!(out.sent[0].1, json!({"p": "/a", "h": "h1"}));
    }

    #[test]
    fn on_disconnect_drains_fifo() {
        let mut ledger = Ledger::default();
        for (kind, path) in [
            (OnDisconnectKind::Put, "/1"),
            (OnDisconnectKind::Merge, "/2"),
            (OnDisconnectKind::Cancel, "/3"),
        ] {
            let (c, _ack) = ack_pair();
            ledger.enqueue_on_disconnect(kind, path.into(), json!(null), c);
        }
        let mut out = Recorder::default();
        ledger.drain_on_disconnect(&mut out);
        assert_eq!(out.actions(), vec!["o", "om", "oc"]);
        assert_eq!(ledger.queued_on_disconnect(), 0);
    }

    #[test]
    fn gets_survive_until_acked() {
        let mut ledger = Ledger::default();
        let (c, mut ack) = ack_pair();
        let slot = ledger.enqueue_get(Query::default_at("/g"), c);
        let mut out = Recorder::default();
        ledger.send_get(slot, &mut out);
        ledger.fail_sent_writes();
        assert_eq!(ledger.outstanding_gets(), 1);
        assert!(ledger.ack_get(slot, Ok(json!("v"))));
        assert!(!ledger.ack_get(slot, Ok(json!("v"))));
        assert_eq!(ack.try_result(), Some(Ok(json!("v"))));
    }

    #[test]
    fn listen_route_carries_serial() {
        let mut ledger = Ledger::default();
        let _rx = listen(&mut ledger, "/a", "h");
        let mut out = Recorder::default();
        ledger.send_listen("/a", "default", &mut out);
        match out.routes.pop().flatten() {
            Some(Route::Listen { path, query_id, serial }) => {
                assert_eq!(path, "/a");
                assert_eq!(query_id, "default");
                assert_eq!(serial, 1);
            }
            other => panic!("expected listen route, got {other:?}"),
        }
    }
}
