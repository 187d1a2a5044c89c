//! Key-set writer.
//!
//! [`KeySetOut`] accumulates the deduplicated key trie of one outgoing
//! transaction. For every appended key it ascends to the common ancestor with
//! the *previous* key and emits only suffix parts that are not already in the
//! set. Stored bytes are never rewritten (they may already be checksummed):
//! strengthening a part appends a stronger copy and redirects the lookup.

use std::collections::HashMap;

use fgalera_types::KeyStrength;
use tracing::trace;
use xxhash_rust::xxh3::Xxh3;

use crate::part::{
    align_up, hash_append, store_part, KeyFingerprint, KeySetVersion,
};
use crate::SECTION_HEADER_SIZE;

/// One key to append: an ordered part path plus the leaf strength.
#[derive(Debug, Clone, Copy)]
pub struct KeyData<'a> {
    /// Ordered key parts, outermost first. Empty for a zero-level key.
    pub parts: &'a [&'a [u8]],
    /// Strength of the operation at the leaf.
    pub strength: KeyStrength,
}

impl<'a> KeyData<'a> {
    /// Ordinary key.
    #[must_use]
    pub const fn new(parts: &'a [&'a [u8]], strength: KeyStrength) -> Self {
        Self { parts, strength }
    }

    /// Zero-level key: empty path standing for the whole object scope.
    #[must_use]
    pub const fn zero_level(strength: KeyStrength) -> Self {
        Self {
            parts: &[],
            strength,
        }
    }

    /// The implicit zero-level key every replicated transaction carries.
    #[must_use]
    pub const fn default_zero_level() -> Self {
        Self::zero_level(KeyStrength::BRANCH)
    }
}

/// Result of one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// `bytes` were added to the set (0 when the key was absorbed by an
    /// equal or stronger entry).
    Added { bytes: usize },
    /// The key duplicates an already-stored entry of equal or stronger
    /// strength. Branch parts emitted before the duplicate was detected
    /// stay in the set; they would be duplicates in certification as well.
    Duplicate { bytes: usize },
}

impl AppendOutcome {
    /// Bytes added by this append.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Added { bytes } | Self::Duplicate { bytes } => bytes,
        }
    }
}

/// Part-chain element remembered from the previously appended key.
struct PrevPart {
    hasher: Xxh3,
    value: Vec<u8>,
    /// Index into `slots`; `None` only for the root before a zero-level
    /// key is stored.
    slot: Option<usize>,
}

/// Deduplicating key-set writer for one outgoing transaction.
pub struct KeySetOut {
    version: KeySetVersion,
    ws_version: u8,
    /// Serialized parts, appended-only.
    buf: Vec<u8>,
    /// Number of stored parts (strengthened copies included).
    stored: usize,
    /// Fingerprint → slot lookup for everything added so far.
    added: HashMap<KeyFingerprint, usize>,
    /// Effective prefix per added entry; strengthening redirects here.
    slots: Vec<KeyStrength>,
    /// Part chain of the previous key, root first.
    prev: Vec<PrevPart>,
}

impl std::fmt::Debug for KeySetOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetOut")
            .field("version", &self.version)
            .field("ws_version", &self.ws_version)
            .field("stored", &self.stored)
            .field("unique", &self.added.len())
            .field("bytes", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl KeySetOut {
    /// Create a writer for the given key-set version and write-set protocol
    /// version.
    #[must_use]
    pub fn new(version: KeySetVersion, ws_version: u8) -> Self {
        Self {
            version,
            ws_version,
            buf: Vec::new(),
            stored: 0,
            added: HashMap::new(),
            slots: Vec::new(),
            prev: vec![PrevPart {
                hasher: Xxh3::new(),
                value: Vec::new(),
                slot: None,
            }],
        }
    }

    /// Number of stored parts.
    #[must_use]
    pub fn count(&self) -> usize {
        self.stored
    }

    /// Current serialized size, section header included.
    #[must_use]
    pub fn size(&self) -> usize {
        SECTION_HEADER_SIZE + self.padded_body_len()
    }

    /// Append one key. See the module docs for the dedup/strengthen rules.
    pub fn append(&mut self, kd: &KeyData<'_>) -> AppendOutcome {
        let old_size = self.buf.len();

        if kd.parts.is_empty() {
            return self.append_zero_level(kd.strength, old_size);
        }

        let mut i = self.common_ancestor_with_previous(kd);

        // A fully matched key, or a strong-enough common ancestor,
        // absorbs the append.
        if i > 0 {
            let kd_leaf_prefix = kd.strength.collapse(self.ws_version);
            let branch_prefix = KeyStrength::branch_for_version(self.ws_version);
            let exclusive_prefix = KeyStrength::Exclusive.collapse(self.ws_version);
            let ca_prefix = self.prev_prefix(i);
            let ca_is_prev_leaf = self.prev.len() == i + 1;
            let ca_is_kd_leaf = kd.parts.len() == i;

            if ca_prefix == exclusive_prefix {
                trace!("key absorbed: common ancestor is exclusive");
                return AppendOutcome::Added { bytes: 0 };
            }

            if ca_is_prev_leaf && ca_prefix > kd_leaf_prefix && ca_prefix > branch_prefix {
                trace!("key absorbed: previous leaf ancestor is stronger");
                return AppendOutcome::Added { bytes: 0 };
            }

            if ca_is_kd_leaf {
                if kd_leaf_prefix <= ca_prefix {
                    trace!("key absorbed: stored strength covers the leaf");
                    return AppendOutcome::Added { bytes: 0 };
                }
                // Need a strengthened copy of the leaf.
                i -= 1;
            }
        }

        let ancestor = i;
        let mut duplicate = false;

        for part_num in ancestor..kd.parts.len() {
            let leaf = part_num + 1 == kd.parts.len();
            let part_type = if leaf {
                kd.strength.collapse(self.ws_version)
            } else {
                KeyStrength::branch_for_version(self.ws_version)
            };

            let mut hasher = self.prev[part_num].hasher.clone();
            hash_append(&mut hasher, kd.parts[part_num]);
            let fingerprint = KeyFingerprint::digest(&hasher).truncate(self.version);

            match self.insert_part(fingerprint, part_type, &kd.parts[..=part_num], leaf) {
                InsertResult::Stored(slot) | InsertResult::Present(slot) => {
                    self.prev.truncate(part_num + 1);
                    self.prev.push(PrevPart {
                        hasher,
                        value: kd.parts[part_num].to_vec(),
                        slot: Some(slot),
                    });
                }
                InsertResult::Duplicate => {
                    // A child may turn out to be a duplicate even after a
                    // parent was added as new; certification will treat it
                    // as a duplicate all the same.
                    duplicate = true;
                    break;
                }
            }
        }

        let bytes = self.buf.len() - old_size;
        if duplicate {
            AppendOutcome::Duplicate { bytes }
        } else {
            AppendOutcome::Added { bytes }
        }
    }

    /// Serialize the whole set: 8-byte header (version, part count, CRC)
    /// followed by the parts, zero-padded to the annotation alignment.
    #[must_use]
    pub fn gather(&self) -> Vec<u8> {
        let body_len = self.padded_body_len();
        let mut out = Vec::with_capacity(SECTION_HEADER_SIZE + body_len);
        out.push(self.version as u8);
        out.push(0);
        out.extend_from_slice(
            &u16::try_from(self.stored.min(usize::from(u16::MAX)))
                .expect("bounded by u16::MAX")
                .to_le_bytes(),
        );

        let mut body = self.buf.clone();
        body.resize(body_len, 0);
        out.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn padded_body_len(&self) -> usize {
        if self.version.annotated() {
            align_up(self.buf.len())
        } else {
            self.buf.len()
        }
    }

    /// Zero-level append: the root itself is the leaf.
    fn append_zero_level(&mut self, strength: KeyStrength, old_size: usize) -> AppendOutcome {
        let fingerprint = KeyFingerprint::root().truncate(self.version);
        let part_type = strength.collapse(self.ws_version);
        let res = self.insert_part(fingerprint, part_type, &[], true);
        if let InsertResult::Stored(slot) | InsertResult::Present(slot) = res {
            self.prev[0].slot = Some(slot);
        }
        let bytes = self.buf.len() - old_size;
        match res {
            InsertResult::Duplicate => AppendOutcome::Duplicate { bytes },
            _ => AppendOutcome::Added { bytes },
        }
    }

    /// Number of leading parts shared with the previously appended key.
    fn common_ancestor_with_previous(&self, kd: &KeyData<'_>) -> usize {
        let mut i = 0;
        while i < kd.parts.len()
            && i + 1 < self.prev.len()
            && self.prev[i + 1].value.as_slice() == kd.parts[i]
        {
            i += 1;
        }
        debug_assert!(i < self.prev.len());
        i
    }

    fn prev_prefix(&self, i: usize) -> KeyStrength {
        self.prev[i]
            .slot
            .map_or(KeyStrength::Shared, |s| self.slots[s])
    }

    fn insert_part(
        &mut self,
        fingerprint: KeyFingerprint,
        prefix: KeyStrength,
        raw_parts: &[&[u8]],
        leaf: bool,
    ) -> InsertResult {
        if let Some(&slot) = self.added.get(&fingerprint) {
            let existing = self.slots[slot];
            if prefix.is_stronger_than(existing) {
                // The stored entry has a weaker constraint. The earlier
                // bytes are already checksummed, so store a duplicate with
                // the stronger constraint and redirect the lookup.
                store_part(&mut self.buf, self.version, prefix, fingerprint, raw_parts);
                self.stored += 1;
                self.slots[slot] = prefix;
                InsertResult::Stored(slot)
            } else if leaf || existing.is_stronger_than(prefix) {
                // A full-key duplicate, or a branch under an exclusive
                // subtree. Branch duplicates of equal strength are absorbed
                // below instead.
                trace!(?fingerprint, "duplicate key part");
                InsertResult::Duplicate
            } else {
                InsertResult::Present(slot)
            }
        } else {
            store_part(&mut self.buf, self.version, prefix, fingerprint, raw_parts);
            self.stored += 1;
            let slot = self.slots.len();
            self.slots.push(prefix);
            self.added.insert(fingerprint, slot);
            InsertResult::Stored(slot)
        }
    }
}

#[derive(Clone, Copy)]
enum InsertResult {
    /// New bytes were stored (fresh entry or strengthened copy).
    Stored(usize),
    /// An equal entry already covers this part.
    Present(usize),
    /// Equal-or-stronger leaf, or branch under a stronger subtree.
    Duplicate,
}
