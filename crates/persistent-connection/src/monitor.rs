//! Online / visibility signal sources.
//!
//! A monitor hands out `watch` receivers; the supervisor holds one per
//! monitor for its lifetime and dropping it is the unsubscribe.

use tokio::sync::watch;

/// A boolean platform signal (network online, application visible).
pub trait StateMonitor: Send + Sync {
    /// Subscribe to state changes. The receiver starts at the current state.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A monitor driven by whoever owns it: platform glue, or a test.
#[derive(Debug)]
pub struct SignalMonitor {
    tx: watch::Sender<bool>,
}

impl SignalMonitor {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new state. Subscribers only wake on an actual change.
    pub fn set(&self, state: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl StateMonitor for SignalMonitor {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
