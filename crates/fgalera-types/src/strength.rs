//! Key strengths and their per-protocol-version collapsing.
//!
//! A key part carries the *strength* of the operation at its leaf. Strengths
//! are totally ordered; older write-set versions cannot represent all four
//! and collapse them when encoding.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Strength of a key reference, weakest first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum KeyStrength {
    /// Read without coherence: never invalidated by later writes.
    Shared = 0,
    /// Read with coherence: invalidated by an exclusive write.
    Reference = 1,
    /// Write without pre-image.
    Update = 2,
    /// Full write.
    Exclusive = 3,
}

impl KeyStrength {
    /// All strengths, weakest first.
    pub const ALL: [Self; 4] = [
        Self::Shared,
        Self::Reference,
        Self::Update,
        Self::Exclusive,
    ];

    /// Strength of non-leaf (branch) key parts: a coherent read, so an
    /// exclusive write higher up the trie invalidates the whole subtree.
    /// Protocol versions below 5 cannot express it and clamp branches to
    /// `Shared` instead (see [`Self::branch_for_version`]).
    pub const BRANCH: Self = Self::Reference;

    /// Effective branch strength for a write-set protocol version.
    ///
    /// Versions 3 and 4 would collapse `Reference` *upward* (v3) or keep it
    /// indistinct from `Shared` (v4); either way branches are encoded
    /// `Shared` there so that a branch never strengthens a stored leaf.
    #[must_use]
    pub const fn branch_for_version(ws_version: u8) -> Self {
        if ws_version >= 5 {
            Self::BRANCH
        } else {
            Self::Shared
        }
    }

    /// Decode a raw prefix byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Shared),
            1 => Some(Self::Reference),
            2 => Some(Self::Update),
            3 => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Index into per-strength tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Collapse to what a given write-set protocol version can express.
    ///
    /// v3 cannot distinguish writes from coherent reads: everything above
    /// `Shared` becomes `Exclusive`. v4 singles out `Exclusive` and folds the
    /// rest into `Shared`. v5 keeps all four.
    #[must_use]
    pub const fn collapse(self, ws_version: u8) -> Self {
        match ws_version {
            0..=3 => match self {
                Self::Shared => Self::Shared,
                _ => Self::Exclusive,
            },
            4 => match self {
                Self::Exclusive => Self::Exclusive,
                _ => Self::Shared,
            },
            _ => self,
        }
    }

    /// Strictly stronger than `other`.
    #[inline]
    #[must_use]
    pub fn is_stronger_than(self, other: Self) -> bool {
        self > other
    }

    /// Two-letter tag used in debug dumps.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Shared => "SH",
            Self::Reference => "RE",
            Self::Update => "UP",
            Self::Exclusive => "EX",
        }
    }
}

impl fmt::Display for KeyStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}
