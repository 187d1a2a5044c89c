//! Global and local sequence numbers.
//!
//! A global seqno is assigned by the group transport in total delivery order
//! and is the sole coordinate every ordering and garbage-collection decision
//! is stated in.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally ordered sequence number (signed, monotonic per group).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Seqno(pub i64);

impl Seqno {
    /// "No seqno assigned yet".
    pub const NONE: Self = Self(0);
    /// Invalid / poisoned seqno, never reused.
    pub const ILL: Self = Self(-1);
    /// Smallest seqno the transport will ever assign.
    pub const FIRST: Self = Self(1);

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether a real seqno has been assigned.
    #[inline]
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 > 0
    }

    /// The seqno immediately following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The seqno immediately preceding this one.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0 - 1)
    }

    /// Saturating max with another seqno.
    #[inline]
    #[must_use]
    pub fn max_with(self, other: Self) -> Self {
        if other.0 > self.0 { other } else { self }
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Seqno {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Local delivery counter, monotonic per node. Never crosses the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LocalSeqno(pub i64);

impl LocalSeqno {
    /// "Not delivered locally".
    pub const NONE: Self = Self(0);

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The next local ordinal.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LocalSeqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
