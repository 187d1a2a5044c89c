//! Write-set flag word.
//!
//! The flags travel in the serialized header and steer both certification
//! and the applier: transaction boundaries, total-order isolation, and the
//! parallel-applier safety override.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit flags carried by every write-set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub struct WsFlags(pub u16);

impl WsFlags {
    /// First fragment of a transaction.
    pub const BEGIN: Self = Self(1 << 0);
    /// Last fragment of a transaction.
    pub const COMMIT: Self = Self(1 << 1);
    /// Transaction was rolled back by its source.
    pub const ROLLBACK: Self = Self(1 << 2);
    /// Total-order isolation: applied serially on every node.
    pub const ISOLATION: Self = Self(1 << 3);
    /// Not safe for parallel apply: forces a dependency on the previous seqno.
    pub const PA_UNSAFE: Self = Self(1 << 4);
    /// Commutative action (reserved, passed through).
    pub const COMMUTATIVE: Self = Self(1 << 5);
    /// Native/opaque action (reserved, passed through).
    pub const NATIVE: Self = Self(1 << 6);

    /// Empty flag word.
    pub const NONE: Self = Self(0);

    /// Whether all bits of `other` are set in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bitwise union.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Raw flag word.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Decode from the wire word, rejecting unknown bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Option<Self> {
        let known = Self::BEGIN.0
            | Self::COMMIT.0
            | Self::ROLLBACK.0
            | Self::ISOLATION.0
            | Self::PA_UNSAFE.0
            | Self::COMMUTATIVE.0
            | Self::NATIVE.0;
        if bits & !known != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    /// Total-order-isolated write-set (a plain TOI or either NBO half).
    #[inline]
    #[must_use]
    pub const fn is_toi(self) -> bool {
        self.contains(Self::ISOLATION)
    }

    /// The opening half of a non-blocking operation: isolation + begin
    /// without commit.
    #[inline]
    #[must_use]
    pub const fn is_nbo_begin(self) -> bool {
        self.contains(Self::ISOLATION.union(Self::BEGIN)) && !self.contains(Self::COMMIT)
    }

    /// The closing half of a non-blocking operation: isolation + commit
    /// without begin.
    #[inline]
    #[must_use]
    pub const fn is_nbo_end(self) -> bool {
        self.contains(Self::ISOLATION.union(Self::COMMIT)) && !self.contains(Self::BEGIN)
    }

    /// Ordinary single-shot transaction span.
    #[inline]
    #[must_use]
    pub const fn is_complete_trx(self) -> bool {
        self.contains(Self::BEGIN.union(Self::COMMIT))
    }
}

impl std::ops::BitOr for WsFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for WsFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(WsFlags, &str); 7] = [
            (WsFlags::BEGIN, "BEGIN"),
            (WsFlags::COMMIT, "COMMIT"),
            (WsFlags::ROLLBACK, "ROLLBACK"),
            (WsFlags::ISOLATION, "ISOLATION"),
            (WsFlags::PA_UNSAFE, "PA_UNSAFE"),
            (WsFlags::COMMUTATIVE, "COMMUTATIVE"),
            (WsFlags::NATIVE, "NATIVE"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nbo_halves() {
        let begin = WsFlags::ISOLATION | WsFlags::BEGIN;
        let end = WsFlags::ISOLATION | WsFlags::COMMIT;
        let toi = WsFlags::ISOLATION | WsFlags::BEGIN | WsFlags::COMMIT;
        assert!(begin.is_nbo_begin());
        assert!(!begin.is_nbo_end());
        assert!(end.is_nbo_end());
        assert!(!end.is_nbo_begin());
        assert!(toi.is_toi());
        assert!(!toi.is_nbo_begin());
        assert!(!toi.is_nbo_end());
    }

    #[test]
    fn unknown_bits_rejected() {
        assert!(WsFlags::from_bits(1 << 15).is_none());
        assert_eq!(
            WsFlags::from_bits(0b11),
            Some(WsFlags::BEGIN | WsFlags::COMMIT)
        );
    }

    #[test]
    fn display_names() {
        let f = WsFlags::BEGIN | WsFlags::PA_UNSAFE;
        assert_eq!(f.to_string(), "BEGIN|PA_UNSAFE");
        assert_eq!(WsFlags::NONE.to_string(), "NONE");
    }
}
