//! Core types shared across the FrankenGalera replication stack.
//!
//! This crate is intentionally dependency-light: identifier newtypes, the
//! write-set flag word, key strengths with protocol-version collapsing, and
//! the typed configuration surface. Everything here is plain data.

pub mod flags;
pub mod ids;
pub mod params;
pub mod seqno;
pub mod strength;

pub use flags::WsFlags;
pub use ids::{ConnId, NodeId, TrxId};
pub use params::{parse_size, Params, ParamsError};
pub use seqno::{LocalSeqno, Seqno};
pub use strength::KeyStrength;

/// Write-set protocol versions supported by this implementation.
pub const WS_VERSION_MIN: u8 = 3;
/// Current (highest) write-set protocol version.
pub const WS_VERSION_MAX: u8 = 5;

/// Payload type carried by an ordered action.
///
/// Only `WriteSet` flows through certification; the other two are ordered
/// control actions that bypass it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionType {
    /// Replicated transaction write-set.
    WriteSet = 0,
    /// Configuration (group view) change.
    ConfChange = 1,
    /// Synchronization point (causal read probe).
    Sync = 2,
}

impl ActionType {
    /// Decode from the wire byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::WriteSet),
            1 => Some(Self::ConfChange),
            2 => Some(Self::Sync),
            _ => None,
        }
    }

    /// Wire encoding.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}
