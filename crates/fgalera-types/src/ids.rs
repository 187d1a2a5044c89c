//! Node, transaction, and connection identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 16-byte unique identifier of an originating node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// All-zero id, used before a node has joined a group.
    pub const UNDEFINED: Self = Self([0; 16]);

    /// Construct from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Convenience constructor for tests: first byte set, rest zero.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0] = b;
        Self(bytes)
    }

    /// Raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Opaque transaction identifier, scoped by the originating [`NodeId`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TrxId(pub u64);

impl TrxId {
    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque connection identifier, scoped by the originating [`NodeId`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_is_uuid_shaped() {
        let id = NodeId::from_byte(1);
        assert_eq!(id.to_string(), "01000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn node_id_ordering_is_bytewise() {
        assert!(NodeId::from_byte(1) < NodeId::from_byte(2));
        assert_eq!(NodeId::UNDEFINED, NodeId::from_bytes([0; 16]));
    }
}
