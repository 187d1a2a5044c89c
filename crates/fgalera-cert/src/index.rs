//! Certification index: key fingerprints to their latest references.
//!
//! Each slot keeps the most recent write-set reference *per strength tier*,
//! so a strengthened duplicate never has to mutate an existing entry — it
//! lands in its own tier and lookups consult all four. Entries are removed
//! when the trail is trimmed past the write-set that inserted them.

use std::collections::{BTreeMap, HashMap};

use fgalera_keyset::KeyFingerprint;
use fgalera_types::{KeyStrength, NodeId, Seqno};

/// One stored reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRef {
    /// Write-set that referenced the key.
    pub seqno: Seqno,
    /// Its originating node.
    pub source: NodeId,
}

/// Per-fingerprint slot: latest reference per strength tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySlot {
    refs: [Option<KeyRef>; 4],
}

impl KeySlot {
    /// Reference at a given strength.
    #[must_use]
    pub fn at(&self, strength: KeyStrength) -> Option<KeyRef> {
        self.refs[strength.index()]
    }

    /// Install/overwrite the reference at a strength.
    pub fn set(&mut self, strength: KeyStrength, key_ref: KeyRef) {
        self.refs[strength.index()] = Some(key_ref);
    }

    /// Clear the reference at a strength when it still points at `seqno`.
    fn clear_if(&mut self, strength: KeyStrength, seqno: Seqno) {
        if self.refs[strength.index()].is_some_and(|r| r.seqno == seqno) {
            self.refs[strength.index()] = None;
        }
    }

    /// Whether no tier holds a reference.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.iter().all(Option::is_none)
    }

    /// References from strongest to weakest tier.
    pub fn strongest_first(&self) -> impl Iterator<Item = (KeyStrength, KeyRef)> + '_ {
        KeyStrength::ALL
            .into_iter()
            .rev()
            .filter_map(|s| self.refs[s.index()].map(|r| (s, r)))
    }
}

/// The index plus the trail that drives eviction.
#[derive(Debug, Default)]
pub struct CertIndex {
    slots: HashMap<KeyFingerprint, KeySlot>,
    /// Per-seqno list of references inserted by that write-set.
    trail: BTreeMap<Seqno, Vec<(KeyFingerprint, KeyStrength)>>,
}

impl CertIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fingerprint.
    #[must_use]
    pub fn get(&self, fp: KeyFingerprint) -> Option<&KeySlot> {
        self.slots.get(&fp)
    }

    /// Record the references of one certified write-set.
    pub fn insert(
        &mut self,
        seqno: Seqno,
        source: NodeId,
        refs: impl IntoIterator<Item = (KeyFingerprint, KeyStrength)>,
    ) {
        let mut inserted = Vec::new();
        for (fp, strength) in refs {
            self.slots
                .entry(fp)
                .or_default()
                .set(strength, KeyRef { seqno, source });
            inserted.push((fp, strength));
        }
        if !inserted.is_empty() {
            self.trail.insert(seqno, inserted);
        }
    }

    /// Evict all references inserted at or below `seqno`; a reference is
    /// only cleared when no newer write-set has overwritten its tier.
    pub fn purge_upto(&mut self, seqno: Seqno) {
        let keep = self.trail.split_off(&seqno.next());
        let purged = std::mem::replace(&mut self.trail, keep);
        for (trx_seqno, refs) in purged {
            for (fp, strength) in refs {
                if let Some(slot) = self.slots.get_mut(&fp) {
                    slot.clear_if(strength, trx_seqno);
                    if slot.is_empty() {
                        self.slots.remove(&fp);
                    }
                }
            }
        }
    }

    /// Number of live fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the index holds no references.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Oldest seqno still contributing references.
    #[must_use]
    pub fn oldest(&self) -> Option<Seqno> {
        self.trail.keys().next().copied()
    }

    /// Drop everything (initial position assignment).
    pub fn clear(&mut self) {
        self.slots.clear();
        self.trail.clear();
    }
}
