//! Group-communication boundary.
//!
//! The replication core only needs two things from the transport: submit an
//! opaque action for total ordering, and learn the ordered actions back.
//! Everything else (membership, flow control, quorum) stays behind this
//! trait. [`LoopbackTransport`] closes the loop in-process for tests and
//! single-node operation: actions are delivered back in submission order.

use std::sync::{Arc, Weak};

use fgalera_error::{GaleraError, Result};
use fgalera_types::Seqno;
use parking_lot::RwLock;
use tracing::trace;

use crate::replicator::Replicator;

/// Totally-ordered action transport.
pub trait Transport: Send + Sync {
    /// Submit an action for total ordering. Returns once the action is
    /// accepted for delivery, not once it is delivered.
    fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Report the highest locally applied seqno (flow control input).
    fn report_last_applied(&self, seqno: Seqno);
}

/// In-process transport: delivery order is submission order.
#[derive(Default)]
pub struct LoopbackTransport {
    replicator: RwLock<Weak<Replicator>>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport").finish_non_exhaustive()
    }
}

impl LoopbackTransport {
    /// Unconnected loopback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the replicator the loop delivers into.
    pub fn attach(&self, replicator: &Arc<Replicator>) {
        *self.replicator.write() = Arc::downgrade(replicator);
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let Some(replicator) = self.replicator.read().upgrade() else {
            return Err(GaleraError::NotConnected);
        };
        // Ordered delivery happens on the sender's thread; the replicator
        // serializes assignment internally.
        replicator.deliver(&bytes)?;
        Ok(())
    }

    fn report_last_applied(&self, seqno: Seqno) {
        trace!(%seqno, "last applied");
    }
}
