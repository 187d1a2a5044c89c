//! Non-blocking operation bookkeeping.
//!
//! An NBO splits a long-running total-order operation into a begin/end
//! pair. The begin installs a persistent context holding the keys it
//! locked; any total-order write-set intersecting those keys fails
//! certification until the matching end (identified by the [`NboKey`] in
//! its data section) arrives and the context is erased.

use std::collections::HashSet;

use fgalera_error::{ensure_len, GaleraError, Result};
use fgalera_keyset::KeyFingerprint;
use fgalera_types::{NodeId, Seqno};

/// Identifies the NBO an end write-set closes: the begin's global seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NboKey(pub Seqno);

/// Serialized size of an [`NboKey`].
pub const NBO_KEY_SIZE: usize = 12;

impl NboKey {
    /// Serialize: 8-byte LE seqno followed by its CRC.
    #[must_use]
    pub fn serialize(&self) -> [u8; NBO_KEY_SIZE] {
        let mut out = [0u8; NBO_KEY_SIZE];
        out[..8].copy_from_slice(&self.0.get().to_le_bytes());
        let crc = crc32c::crc32c(&out[..8]);
        out[8..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse from the head of a data section.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, NBO_KEY_SIZE)?;
        let stored = u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
        let computed = crc32c::crc32c(&buf[..8]);
        if stored != computed {
            return Err(GaleraError::ChecksumMismatch {
                what: "nbo key",
                computed,
                stored,
            });
        }
        Ok(Self(Seqno(i64::from_le_bytes(
            buf[..8].try_into().expect("8 bytes"),
        ))))
    }
}

/// One active non-blocking operation.
#[derive(Debug, Clone)]
pub struct NboCtx {
    /// Seqno of the begin write-set.
    pub begin: Seqno,
    /// Node that initiated the operation.
    pub source: NodeId,
    /// Keys the operation holds exclusively.
    pub keys: HashSet<KeyFingerprint>,
}

impl NboCtx {
    /// New context from the begin write-set's keys.
    #[must_use]
    pub fn new(begin: Seqno, source: NodeId, keys: HashSet<KeyFingerprint>) -> Self {
        Self {
            begin,
            source,
            keys,
        }
    }

    /// Whether any of `fingerprints` intersects the held keys.
    #[must_use]
    pub fn intersects<'a>(&self, mut fingerprints: impl Iterator<Item = &'a KeyFingerprint>) -> bool {
        fingerprints.any(|fp| self.keys.contains(fp))
    }
}
