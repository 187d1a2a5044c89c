//! Plaintext shadow buffers.
//!
//! Callers never touch store bytes directly: every open buffer has exactly
//! one [`PlainBuf`], handed out as an `Arc`. In encrypted mode the shadow is
//! the decrypted view of page ciphertext; in plain mode it is a write-back
//! cache in front of the store. A `changed` shadow is flushed to the store
//! before it is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::BufferId;

/// Reference-counted plaintext view of one cache buffer.
pub struct PlainBuf {
    bytes: RwLock<Vec<u8>>,
    changed: AtomicBool,
}

impl std::fmt::Debug for PlainBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainBuf")
            .field("len", &self.bytes.read().len())
            .field("changed", &self.is_changed())
            .finish()
    }
}

impl PlainBuf {
    /// Wrap plaintext bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
            changed: AtomicBool::new(false),
        }
    }

    /// Read access.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read()
    }

    /// Write access; marks the shadow changed.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.changed.store(true, Ordering::Release);
        self.bytes.write()
    }

    /// Current length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the plaintext diverged from the store.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Clear the changed flag after a flush.
    pub fn mark_clean(&self) {
        self.changed.store(false, Ordering::Release);
    }
}

/// One tracked shadow.
#[derive(Debug)]
struct Shadow {
    buf: Arc<PlainBuf>,
    /// Buffer was freed while plaintext references were still out.
    freed: bool,
}

/// Shadow registry with a soft byte budget.
///
/// The budget is advisory: allocations are never refused, but once it is
/// exceeded, fully released shadows are evicted on drop instead of cached.
#[derive(Debug)]
pub struct ShadowMap {
    shadows: HashMap<BufferId, Shadow>,
    total_bytes: usize,
    keep_bytes: usize,
}

impl ShadowMap {
    /// Create with the given soft budget.
    #[must_use]
    pub fn new(keep_bytes: usize) -> Self {
        Self {
            shadows: HashMap::new(),
            total_bytes: 0,
            keep_bytes,
        }
    }

    /// Total bytes of retained plaintext.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of retained shadows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shadows.len()
    }

    /// Whether no shadows are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shadows.is_empty()
    }

    /// Register a fresh shadow and hand out its reference.
    pub fn insert(&mut self, id: BufferId, bytes: Vec<u8>) -> Arc<PlainBuf> {
        let buf = Arc::new(PlainBuf::new(bytes));
        self.total_bytes += buf.len();
        self.shadows.insert(
            id,
            Shadow {
                buf: Arc::clone(&buf),
                freed: false,
            },
        );
        buf
    }

    /// Existing shadow for `id`, if retained.
    #[must_use]
    pub fn get(&self, id: BufferId) -> Option<Arc<PlainBuf>> {
        self.shadows.get(&id).map(|s| Arc::clone(&s.buf))
    }

    /// Whether outstanding references exist besides the registry's own.
    #[must_use]
    pub fn has_external_refs(&self, id: BufferId) -> bool {
        self.shadows
            .get(&id)
            .is_some_and(|s| Arc::strong_count(&s.buf) > 1)
    }

    /// Mark the buffer freed while references are still out.
    pub fn mark_freed(&mut self, id: BufferId) {
        if let Some(s) = self.shadows.get_mut(&id) {
            s.freed = true;
        }
    }

    /// Whether the shadow was marked freed.
    #[must_use]
    pub fn is_freed(&self, id: BufferId) -> bool {
        self.shadows.get(&id).is_some_and(|s| s.freed)
    }

    /// Remove a shadow unconditionally, returning it for a final flush.
    pub fn remove(&mut self, id: BufferId) -> Option<Arc<PlainBuf>> {
        self.shadows.remove(&id).map(|s| {
            self.total_bytes -= s.buf.len();
            s.buf
        })
    }

    /// Whether the soft budget is exceeded.
    #[must_use]
    pub fn over_budget(&self) -> bool {
        self.total_bytes > self.keep_bytes
    }

    /// Shadows eligible for eviction (no external refs), oldest-insertion
    /// order is not tracked; any eligible one may be evicted.
    pub fn evictable(&self) -> Vec<BufferId> {
        self.shadows
            .iter()
            .filter(|(_, s)| Arc::strong_count(&s.buf) == 1)
            .map(|(id, _)| *id)
            .collect()
    }
}
