//! Connection lifecycle listeners.
//!
//! Components layered on the client (subscribers re-issuing their
//! subscriptions, shared hashes scheduling a resync) need to know when
//! the connection dies and when a new one is up. Listeners are held
//! weakly, so a listener's owner controls its lifetime; epochs let a
//! listener correlate lost/established pairs without ambiguity when
//! reconnects race its own bookkeeping.

use std::sync::{Arc, Mutex, Weak};

use crate::error::ConnectionError;
use crate::sync;

/// Receives connection lifecycle events.
///
/// Callbacks run on the connection manager's own task while it holds the
/// listener registry lock: they must not block, and anything they send
/// must bypass backpressure. The lock is also what makes detaching a
/// barrier — once `detach_listener` returns, no further callback can be
/// in flight. A callback that panics poisons nothing lasting; the
/// registry recovers its lock.
pub trait ConnectionListener: Send + Sync {
    /// The connection identified by `epoch` is gone.
    fn notify_connection_lost(&self, _epoch: u64, _err: &ConnectionError) {}

    /// A new connection is up (and through its handshake, if any).
    fn notify_connection_established(&self, _epoch: u64) {}
}

/// The client's listener registry.
pub(crate) struct ListenerSet {
    entries: Mutex<Vec<Weak<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn attach(&self, listener: Weak<dyn ConnectionListener>) {
        sync::lock(&self.entries).push(listener);
    }

    /// Removes `listener`. Synchronizes with in-flight notifications:
    /// returns only once no callback to this listener can fire again.
    pub(crate) fn detach(&self, listener: &Arc<dyn ConnectionListener>) {
        let target = Arc::downgrade(listener);
        sync::lock(&self.entries).retain(|entry| !Weak::ptr_eq(entry, &target));
    }

    pub(crate) fn notify_established(&self, epoch: u64) {
        let mut entries = sync::lock(&self.entries);
        entries.retain(|entry| match entry.upgrade() {
            Some(listener) => {
                listener.notify_connection_established(epoch);
                true
            }
            None => false,
        });
    }

    pub(crate) fn notify_lost(&self, epoch: u64, err: &ConnectionError) {
        let mut entries = sync::lock(&self.entries);
        entries.retain(|entry| match entry.upgrade() {
            Some(listener) => {
                listener.notify_connection_lost(epoch, err);
                true
            }
            None => false,
        });
    }
}
