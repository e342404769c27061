//! Exactly-once completion for a single operation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::types::{OpResult, OperationError};

/// Completion side, held by the ledger. Consumed when the outcome is known.
#[derive(Debug)]
pub(crate) struct Completion(oneshot::Sender<OpResult>);

impl Completion {
    pub fn complete(self, result: OpResult) {
        // The caller may have dropped its `Ack`; nothing to deliver then.
        let _ = self.0.send(result);
    }
}

/// Resolves once with the server's answer for a write, get, or
/// on-disconnect registration.
///
/// Resolves to [`OperationError::Abandoned`] if the client shuts down, or the
/// request was in flight on a connection that dropped, before the server
/// answered.
#[derive(Debug)]
#[must_use = "an Ack does nothing unless awaited; drop it to ignore the outcome"]
pub struct Ack(oneshot::Receiver<OpResult>);

impl Ack {
    /// Non-blocking peek; `None` while the operation is outstanding.
    pub fn try_result(&mut self) -> Option<OpResult> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(OperationError::Abandoned)),
        }
    }
}

impl Future for Ack {
    type Output = OpResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(OperationError::Abandoned)))
    }
}

pub(crate) fn ack_pair() -> (Completion, Ack) {
    let (tx, rx) = oneshot::channel();
    (Completion(tx), Ack(rx))
}
