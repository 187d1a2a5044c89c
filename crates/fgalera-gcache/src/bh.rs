//! On-disk buffer header.
//!
//! Every buffer in the ring file and in page files is preceded by a fixed
//! 24-byte header. A zeroed header is the end-of-chain sentinel that
//! recovery stops at.

use fgalera_types::Seqno;

/// Backing store of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreTag {
    /// Bounded heap store.
    Mem = 1,
    /// Memory-mapped ring file.
    Ring = 2,
    /// Append-only page file.
    Page = 3,
}

impl StoreTag {
    /// Decode the store byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Mem),
            2 => Some(Self::Ring),
            3 => Some(Self::Page),
            _ => None,
        }
    }
}

/// Serialized header size.
pub const BH_SIZE: usize = 24;

/// Buffer alignment within file stores.
pub const BH_ALIGNMENT: usize = 8;

/// Released flag bit.
const FLAG_RELEASED: u8 = 1 << 0;
/// Skip flag bit (ordered but not applied).
const FLAG_SKIP: u8 = 1 << 1;

/// Decoded buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Payload size (header excluded).
    pub size: u32,
    /// Assigned global seqno, [`Seqno::NONE`] until ordered.
    pub seqno: Seqno,
    /// Action type byte.
    pub buf_type: u8,
    /// Released/skip flags.
    pub flags: u8,
    /// Backing store.
    pub store: StoreTag,
}

impl BufferHeader {
    /// Fresh header for a newly allocated buffer.
    #[must_use]
    pub const fn new(size: u32, store: StoreTag) -> Self {
        Self {
            size,
            seqno: Seqno::NONE,
            buf_type: 0,
            flags: 0,
            store,
        }
    }

    /// Whether the buffer has been released by its user.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.flags & FLAG_RELEASED != 0
    }

    /// Mark released.
    pub fn release(&mut self) {
        self.flags |= FLAG_RELEASED;
    }

    /// Clear the released flag (a seqno lookup revives the buffer).
    pub fn unrelease(&mut self) {
        self.flags &= !FLAG_RELEASED;
    }

    /// Whether the buffer is ordered but skipped by the applier.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        self.flags & FLAG_SKIP != 0
    }

    /// Set or clear the skip flag.
    pub fn set_skip(&mut self, skip: bool) {
        if skip {
            self.flags |= FLAG_SKIP;
        } else {
            self.flags &= !FLAG_SKIP;
        }
    }

    /// Serialize into the fixed wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; BH_SIZE] {
        let mut out = [0u8; BH_SIZE];
        out[..4].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&self.seqno.get().to_le_bytes());
        out[16] = self.buf_type;
        out[17] = self.flags;
        out[18] = self.store as u8;
        out
    }

    /// Decode a header; `None` for the zeroed sentinel or garbage.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < BH_SIZE {
            return None;
        }
        let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if size == 0 {
            return None; // sentinel
        }
        let seqno = Seqno(i64::from_le_bytes(
            buf[8..16].try_into().expect("slice of 8"),
        ));
        let store = StoreTag::from_byte(buf[18])?;
        Some(Self {
            size,
            seqno,
            buf_type: buf[16],
            flags: buf[17],
            store,
        })
    }
}

/// Total aligned footprint of a buffer with `payload` bytes of content.
#[must_use]
pub const fn bh_size(payload: usize) -> usize {
    align_up(BH_SIZE + payload)
}

/// Round up to the store alignment.
#[must_use]
pub const fn align_up(n: usize) -> usize {
    (n + BH_ALIGNMENT - 1) / BH_ALIGNMENT * BH_ALIGNMENT
}
