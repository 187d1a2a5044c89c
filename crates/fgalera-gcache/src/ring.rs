//! File-backed ring store.
//!
//! One fixed-size file used as a ring of header-prefixed buffers. The
//! in-memory image is authoritative; it is written through to the file on
//! [`RingStore::persist`] and scanned back on recovery. Allocation is
//! append-at-tail with a wrap to offset 0 once the tail no longer fits;
//! space is reclaimed only from the head, in allocation order.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use fgalera_error::{GaleraError, Result};
use tracing::{debug, info};

use crate::bh::{bh_size, BufferHeader, StoreTag, BH_SIZE};
use crate::BufferId;

#[derive(Debug, Clone, Copy)]
struct RingSlot {
    id: BufferId,
    offset: usize,
    footprint: usize,
    discarded: bool,
}

/// The ring store.
#[derive(Debug)]
pub struct RingStore {
    path: PathBuf,
    image: Vec<u8>,
    queue: VecDeque<RingSlot>,
    offsets: HashMap<BufferId, (usize, usize)>, // id -> (offset, payload_len)
}

impl RingStore {
    /// Create a fresh ring of `size` bytes backed by `path`.
    pub fn create(path: &Path, size: usize) -> Result<Self> {
        info!(path = %path.display(), size, "creating ring buffer");
        Ok(Self {
            path: path.to_owned(),
            image: vec![0u8; size],
            queue: VecDeque::new(),
            offsets: HashMap::new(),
        })
    }

    /// Open an existing ring file for recovery scanning.
    pub fn open(path: &Path) -> Result<Self> {
        let image = fs::read(path).map_err(|_| GaleraError::CannotOpen {
            path: path.to_owned(),
        })?;
        Ok(Self {
            path: path.to_owned(),
            image,
            queue: VecDeque::new(),
            offsets: HashMap::new(),
        })
    }

    /// Ring capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.image.len()
    }

    /// Try to allocate `payload` bytes for `id`; returns the offset.
    pub fn alloc(&mut self, id: BufferId, payload: usize) -> Option<usize> {
        let footprint = bh_size(payload);
        if footprint > self.image.len() {
            return None;
        }

        let (offset, limit) = if self.queue.is_empty() {
            (0, self.image.len())
        } else {
            let front = self.queue.front().expect("non-empty").offset;
            let back = self.queue.back().expect("non-empty");
            let tail = back.offset + back.footprint;
            let wrapped = front > back.offset;

            if wrapped {
                if tail + footprint <= front {
                    (tail, front)
                } else {
                    return None;
                }
            } else if tail + footprint <= self.image.len() {
                (tail, self.image.len())
            } else if footprint < front {
                // Wrap: terminate the current chain and restart at 0.
                self.write_sentinel(tail, self.image.len());
                (0, front)
            } else {
                return None;
            }
        };

        self.queue.push_back(RingSlot {
            id,
            offset,
            footprint,
            discarded: false,
        });
        self.offsets.insert(id, (offset, payload));
        self.write_sentinel(offset + footprint, limit);
        Some(offset)
    }

    /// Grow/shrink the most recent allocation in place.
    pub fn resize_tail(&mut self, id: BufferId, payload: usize) -> bool {
        let Some(back) = self.queue.back() else {
            return false;
        };
        if back.id != id {
            return false;
        }
        let new_footprint = bh_size(payload);
        let front = self.queue.front().expect("non-empty").offset;
        let wrapped = front > back.offset;
        let limit = if wrapped { front } else { self.image.len() };
        if back.offset + new_footprint > limit {
            return false;
        }
        let offset = back.offset;
        self.queue.back_mut().expect("non-empty").footprint = new_footprint;
        self.offsets.insert(id, (offset, payload));
        self.write_sentinel(offset + new_footprint, limit);
        true
    }

    /// Write header and payload through to the image.
    pub fn flush(&mut self, id: BufferId, bh: &BufferHeader, payload: &[u8]) {
        debug_assert_eq!(bh.store, StoreTag::Ring);
        if let Some(&(offset, len)) = self.offsets.get(&id) {
            debug_assert!(payload.len() <= len);
            self.image[offset..offset + BH_SIZE].copy_from_slice(&bh.to_bytes());
            self.image[offset + BH_SIZE..offset + BH_SIZE + payload.len()]
                .copy_from_slice(payload);
        }
    }

    /// Update only the stored header (seqno assignment, release flags).
    pub fn flush_header(&mut self, id: BufferId, bh: &BufferHeader) {
        if let Some(&(offset, _)) = self.offsets.get(&id) {
            self.image[offset..offset + BH_SIZE].copy_from_slice(&bh.to_bytes());
        }
    }

    /// Payload bytes of a buffer.
    #[must_use]
    pub fn bytes(&self, id: BufferId) -> Option<&[u8]> {
        self.offsets
            .get(&id)
            .map(|&(offset, len)| &self.image[offset + BH_SIZE..offset + BH_SIZE + len])
    }

    /// Whether this store holds `id`.
    #[must_use]
    pub fn contains(&self, id: BufferId) -> bool {
        self.offsets.contains_key(&id)
    }

    /// Discard a buffer. Space is reclaimed once the discard frontier
    /// reaches it from the head.
    pub fn discard(&mut self, id: BufferId) {
        if self.offsets.remove(&id).is_none() {
            return;
        }
        for slot in &mut self.queue {
            if slot.id == id {
                slot.discarded = true;
                break;
            }
        }
        while self.queue.front().is_some_and(|s| s.discarded) {
            self.queue.pop_front();
        }
    }

    /// Write the image back to the ring file.
    pub fn persist(&self) -> Result<()> {
        fs::write(&self.path, &self.image)?;
        Ok(())
    }

    /// Scan the image for header-chained buffers (recovery).
    ///
    /// Returns `(offset, header)` pairs up to the first sentinel. Buffers
    /// whose headers fail to decode terminate the scan.
    #[must_use]
    pub fn scan(&self) -> Vec<(usize, BufferHeader)> {
        let mut found = Vec::new();
        let mut offset = 0usize;
        while offset + BH_SIZE <= self.image.len() {
            let Some(bh) = BufferHeader::from_bytes(&self.image[offset..]) else {
                break;
            };
            if bh.store != StoreTag::Ring
                || offset + bh_size(bh.size as usize) > self.image.len()
            {
                debug!(offset, "ring scan stopped at inconsistent header");
                break;
            }
            found.push((offset, bh));
            offset += bh_size(bh.size as usize);
        }
        found
    }

    /// Adopt a scanned buffer into the allocation structures (recovery).
    pub fn adopt(&mut self, id: BufferId, offset: usize, payload: usize) {
        self.queue.push_back(RingSlot {
            id,
            offset,
            footprint: bh_size(payload),
            discarded: false,
        });
        self.offsets.insert(id, (offset, payload));
    }

    /// Zero a header at `offset`, but only when it falls inside free space
    /// bounded by `limit` (it must never clobber a live buffer).
    fn write_sentinel(&mut self, offset: usize, limit: usize) {
        if offset + BH_SIZE <= limit.min(self.image.len()) {
            self.image[offset..offset + BH_SIZE].fill(0);
        }
    }
}
