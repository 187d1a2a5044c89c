//! One-shot waiters and the per-transaction waiter registry.
//!
//! The registry parks a replicating client thread until the receiver
//! thread observes its write-set coming back from the group, keyed by
//! `(source node, transaction id)`. Signalling holds the map lock only for
//! the lookup; the wait itself runs on the waiter's own mutex and condvar.

use std::collections::BTreeMap;
use std::sync::Arc;

use fgalera_types::{NodeId, TrxId};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Waiting,
    Signaled,
    Interrupted,
}

/// A one-shot signal with an interrupted outcome.
#[derive(Debug)]
pub struct WriteSetWaiter {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl Default for WriteSetWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteSetWaiter {
    /// Fresh, unsignaled waiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Waiting),
            cond: Condvar::new(),
        }
    }

    /// Wake the waiter normally.
    pub fn signal(&self) {
        self.finish(WaitState::Signaled);
    }

    /// Wake the waiter with a cancelled outcome.
    pub fn interrupt(&self) {
        self.finish(WaitState::Interrupted);
    }

    /// Block until signaled; returns `true` when interrupted.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while *state == WaitState::Waiting {
            self.cond.wait(&mut state);
        }
        *state == WaitState::Interrupted
    }

    fn finish(&self, outcome: WaitState) {
        let mut state = self.state.lock();
        if *state == WaitState::Waiting {
            *state = outcome;
        }
        self.cond.notify_all();
    }
}

/// Registry of client threads waiting for their write-sets to return from
/// the group.
#[derive(Debug, Default)]
pub struct WriteSetWaiters {
    map: Mutex<BTreeMap<(NodeId, TrxId), Arc<WriteSetWaiter>>>,
}

impl WriteSetWaiters {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `(node_id, trx_id)`; repeated registration
    /// returns the existing waiter.
    pub fn register(&self, node_id: NodeId, trx_id: TrxId) -> Arc<WriteSetWaiter> {
        let mut map = self.map.lock();
        Arc::clone(
            map.entry((node_id, trx_id))
                .or_insert_with(|| Arc::new(WriteSetWaiter::new())),
        )
    }

    /// Drop the registration for `(node_id, trx_id)`.
    pub fn unregister(&self, node_id: NodeId, trx_id: TrxId) {
        self.map.lock().remove(&(node_id, trx_id));
    }

    /// Signal the waiter for `(node_id, trx_id)`, if registered.
    pub fn signal(&self, node_id: NodeId, trx_id: TrxId) {
        let waiter = self.map.lock().get(&(node_id, trx_id)).cloned();
        if let Some(waiter) = waiter {
            waiter.signal();
        }
    }

    /// Interrupt every registered waiter (connection teardown).
    pub fn interrupt_waiters(&self) {
        let waiting: Vec<_> = self.map.lock().values().cloned().collect();
        for waiter in waiting {
            waiter.interrupt();
        }
    }

    /// Number of registered waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether no waiters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}
