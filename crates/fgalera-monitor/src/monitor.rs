//! The generic seqno-ordered monitor.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use fgalera_error::{GaleraError, Result};
use fgalera_types::Seqno;
use parking_lot::Mutex;
use tracing::trace;

use crate::waiter::WriteSetWaiter;

/// Admission predicate of one monitor flavor.
pub trait MonitorPolicy: Send + Sync + 'static {
    /// Monitor name for logs.
    const NAME: &'static str;

    /// Whether a write-set at `g` with dependency `depends` may enter,
    /// given the monitor frontier.
    fn can_enter(g: Seqno, depends: Seqno, last_entered: Seqno, last_left: Seqno) -> bool;
}

/// Local monitor: strict entry order, pipelined.
#[derive(Debug)]
pub struct LocalOrder;

impl MonitorPolicy for LocalOrder {
    const NAME: &'static str = "local";

    fn can_enter(g: Seqno, _depends: Seqno, last_entered: Seqno, _last_left: Seqno) -> bool {
        g == last_entered.next()
    }
}

/// Apply monitor: admitted once the dependency frontier has passed.
#[derive(Debug)]
pub struct ApplyOrder;

impl MonitorPolicy for ApplyOrder {
    const NAME: &'static str = "apply";

    fn can_enter(_g: Seqno, depends: Seqno, _last_entered: Seqno, last_left: Seqno) -> bool {
        depends <= last_left
    }
}

/// Commit monitor: strictly serial.
#[derive(Debug)]
pub struct CommitOrder;

impl MonitorPolicy for CommitOrder {
    const NAME: &'static str = "commit";

    fn can_enter(g: Seqno, _depends: Seqno, _last_entered: Seqno, last_left: Seqno) -> bool {
        g == last_left.next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Entered,
    Left,
}

struct State {
    last_entered: Seqno,
    last_left: Seqno,
    /// Seqnos above `last_left` that have entered or left.
    window: BTreeMap<Seqno, SlotState>,
    /// Blocked entrants, by seqno, with their dependency.
    waiters: BTreeMap<Seqno, (Seqno, Arc<WriteSetWaiter>)>,
    /// Drain calls blocked until `last_left` reaches their seqno.
    drainers: Vec<(Seqno, Arc<WriteSetWaiter>)>,
    /// Interrupts delivered before the target started waiting.
    pending_interrupts: BTreeSet<Seqno>,
}

/// A seqno-ordered admission barrier.
pub struct OrderedMonitor<P: MonitorPolicy> {
    state: Mutex<State>,
    _policy: PhantomData<P>,
}

impl<P: MonitorPolicy> std::fmt::Debug for OrderedMonitor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OrderedMonitor")
            .field("policy", &P::NAME)
            .field("last_entered", &state.last_entered)
            .field("last_left", &state.last_left)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

impl<P: MonitorPolicy> Default for OrderedMonitor<P> {
    fn default() -> Self {
        Self::new(Seqno::NONE)
    }
}

impl<P: MonitorPolicy> OrderedMonitor<P> {
    /// Create with both frontiers at `position`.
    #[must_use]
    pub fn new(position: Seqno) -> Self {
        Self {
            state: Mutex::new(State {
                last_entered: position,
                last_left: position,
                window: BTreeMap::new(),
                waiters: BTreeMap::new(),
                drainers: Vec::new(),
                pending_interrupts: BTreeSet::new(),
            }),
            _policy: PhantomData,
        }
    }

    /// Highest seqno that has entered.
    pub fn last_entered(&self) -> Seqno {
        self.state.lock().last_entered
    }

    /// Highest seqno such that everything at or below it has left.
    pub fn last_left(&self) -> Seqno {
        self.state.lock().last_left
    }

    /// Block until the write-set at `g` (waiting on `depends`) may enter.
    ///
    /// Returns [`GaleraError::Interrupted`] when [`Self::interrupt`] wakes
    /// the waiter; the caller is then responsible for
    /// [`Self::self_cancel`]ing this seqno.
    pub fn enter(&self, g: Seqno, depends: Seqno) -> Result<()> {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.pending_interrupts.remove(&g) {
                    trace!(monitor = P::NAME, %g, "entry interrupted");
                    return Err(GaleraError::Interrupted);
                }
                if P::can_enter(g, depends, state.last_entered, state.last_left) {
                    state.last_entered = state.last_entered.max_with(g);
                    state.window.insert(g, SlotState::Entered);
                    self.wake_eligible(&mut state);
                    return Ok(());
                }
                let waiter = Arc::new(WriteSetWaiter::new());
                state.waiters.insert(g, (depends, Arc::clone(&waiter)));
                waiter
            };

            if waiter.wait() {
                // Interrupted while waiting; drop the registration if it is
                // still there.
                self.state.lock().waiters.remove(&g);
                trace!(monitor = P::NAME, %g, "wait interrupted");
                return Err(GaleraError::Interrupted);
            }
        }
    }

    /// Leave the monitor, advancing the left frontier.
    pub fn leave(&self, g: Seqno) {
        let mut state = self.state.lock();
        let slot = state.window.insert(g, SlotState::Left);
        assert_eq!(
            slot,
            Some(SlotState::Entered),
            "{} monitor: leave({g}) without enter",
            P::NAME
        );
        Self::advance_left(&mut state);
        self.wake_eligible(&mut state);
    }

    /// Leave without entering: the write-set was aborted or certified out,
    /// but the frontier must still advance contiguously.
    pub fn self_cancel(&self, g: Seqno) {
        let mut state = self.state.lock();
        let slot = state.window.insert(g, SlotState::Left);
        assert!(
            slot.is_none(),
            "{} monitor: self_cancel({g}) after enter",
            P::NAME
        );
        state.last_entered = state.last_entered.max_with(g);
        // A pending interrupt for a cancelled seqno has nobody left to hit.
        state.pending_interrupts.remove(&g);
        Self::advance_left(&mut state);
        self.wake_eligible(&mut state);
    }

    /// Wake the waiter for `g` with a cancelled outcome. A later (or
    /// concurrent) `enter(g)` observes the interrupt instead of blocking.
    pub fn interrupt(&self, g: Seqno) {
        let mut state = self.state.lock();
        if let Some((_, waiter)) = state.waiters.remove(&g) {
            waiter.interrupt();
        } else {
            state.pending_interrupts.insert(g);
        }
    }

    /// Interrupt every blocked entrant (shutdown path).
    pub fn interrupt_waiters(&self) {
        let mut state = self.state.lock();
        let waiting: Vec<_> = state.waiters.values().map(|(_, w)| Arc::clone(w)).collect();
        state.waiters.clear();
        drop(state);
        for waiter in waiting {
            waiter.interrupt();
        }
    }

    /// Block until everything at or below `g` has left.
    pub fn drain_upto(&self, g: Seqno) {
        let waiter = {
            let mut state = self.state.lock();
            if state.last_left >= g {
                return;
            }
            let waiter = Arc::new(WriteSetWaiter::new());
            state.drainers.push((g, Arc::clone(&waiter)));
            waiter
        };
        let _ = waiter.wait();
    }

    fn advance_left(state: &mut State) {
        while let Some(entry) = state.window.first_entry() {
            if *entry.key() == state.last_left.next() && *entry.get() == SlotState::Left {
                state.last_left = state.last_left.next();
                entry.remove();
            } else {
                break;
            }
        }
        let frontier = state.last_left;
        state.drainers.retain(|(g, waiter)| {
            if frontier >= *g {
                waiter.signal();
                false
            } else {
                true
            }
        });
    }

    fn wake_eligible(&self, state: &mut State) {
        let eligible: Vec<Seqno> = state
            .waiters
            .iter()
            .filter(|(g, (depends, _))| {
                P::can_enter(**g, *depends, state.last_entered, state.last_left)
                    || state.pending_interrupts.contains(g)
            })
            .map(|(g, _)| *g)
            .collect();
        for g in eligible {
            if let Some((_, waiter)) = state.waiters.remove(&g) {
                waiter.signal();
            }
        }
    }
}
