//! Bounded heap store: the fast path for small, short-lived buffers.

use std::collections::HashMap;

use crate::bh::bh_size;
use crate::BufferId;

/// Heap store with a byte budget.
#[derive(Debug)]
pub struct MemStore {
    budget: usize,
    used: usize,
    bufs: HashMap<BufferId, Vec<u8>>,
}

impl MemStore {
    /// Create with a byte budget; a zero budget disables the store.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            bufs: HashMap::new(),
        }
    }

    /// Bytes currently allocated (aligned footprints).
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Try to allocate `payload` bytes for `id`. Fails (returns `false`)
    /// when the budget would be exceeded.
    pub fn alloc(&mut self, id: BufferId, payload: usize) -> bool {
        let footprint = bh_size(payload);
        if self.used + footprint > self.budget {
            return false;
        }
        self.used += footprint;
        self.bufs.insert(id, vec![0u8; payload]);
        true
    }

    /// Authoritative bytes of a buffer.
    #[must_use]
    pub fn bytes(&self, id: BufferId) -> Option<&[u8]> {
        self.bufs.get(&id).map(Vec::as_slice)
    }

    /// Overwrite the buffer contents (shadow flush).
    pub fn store(&mut self, id: BufferId, bytes: &[u8]) {
        if let Some(buf) = self.bufs.get_mut(&id) {
            debug_assert_eq!(buf.len(), bytes.len());
            buf.copy_from_slice(bytes);
        }
    }

    /// Resize a buffer in place (unordered buffers only).
    pub fn resize(&mut self, id: BufferId, payload: usize) -> bool {
        if let Some(buf) = self.bufs.get_mut(&id) {
            let old = bh_size(buf.len());
            let new = bh_size(payload);
            if self.used - old + new > self.budget {
                return false;
            }
            self.used = self.used - old + new;
            buf.resize(payload, 0);
            true
        } else {
            false
        }
    }

    /// Discard a buffer, reclaiming its budget.
    pub fn discard(&mut self, id: BufferId) {
        if let Some(buf) = self.bufs.remove(&id) {
            self.used -= bh_size(buf.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bh::BH_SIZE;

    #[test]
    fn budget_is_enforced() {
        let mut ms = MemStore::new(2 * (BH_SIZE + 64));
        assert!(ms.alloc(BufferId(1), 64));
        assert!(ms.alloc(BufferId(2), 64));
        assert!(!ms.alloc(BufferId(3), 64));

        ms.discard(BufferId(1));
        assert!(ms.alloc(BufferId(3), 64));
    }

    #[test]
    fn store_and_read_back() {
        let mut ms = MemStore::new(1 << 16);
        ms.alloc(BufferId(7), 4);
        ms.store(BufferId(7), &[1, 2, 3, 4]);
        assert_eq!(ms.bytes(BufferId(7)), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn resize_in_place() {
        let mut ms = MemStore::new(1 << 10);
        ms.alloc(BufferId(1), 8);
        ms.store(BufferId(1), &[9u8; 8]);
        assert!(ms.resize(BufferId(1), 16));
        assert_eq!(&ms.bytes(BufferId(1)).unwrap()[..8], &[9u8; 8]);
        assert_eq!(ms.bytes(BufferId(1)).unwrap().len(), 16);
    }
}
