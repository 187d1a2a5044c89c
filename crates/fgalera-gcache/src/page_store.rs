//! Append-only page-file store.
//!
//! Pages are numbered files `gcache.page.NNNNNN` allocated bump-pointer
//! style. Every page starts with an aligned nonce block and a released
//! buffer holding the encryption-key record; the last allocation failure
//! closes the page by writing an empty-header sentinel. Pages are deleted
//! from the front of the chain once unreferenced and outside the keep
//! window; deletion is handed to an injected [`PageReaper`] so file unlinks
//! can run on a worker thread.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fgalera_error::Result;
use tracing::{debug, error, info};

use crate::bh::{align_up, bh_size, BufferHeader, StoreTag, BH_SIZE};
use crate::enc::{apply_whole, iv_at, EncDirection, EncryptCb, IV_SIZE};
use crate::BufferId;

/// Page file name prefix.
pub const PAGE_BASE_NAME: &str = "gcache.page.";

/// Receives page files to unlink.
///
/// The default implementation removes the file synchronously; the service
/// thread of the replicator installs an asynchronous one.
pub trait PageReaper: Send + Sync {
    /// Unlink a page file.
    fn unlink(&self, path: PathBuf);
}

/// Synchronous fallback reaper.
#[derive(Debug, Default)]
pub struct SyncReaper;

impl PageReaper for SyncReaper {
    fn unlink(&self, path: PathBuf) {
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "deleted page"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to remove page file"),
        }
    }
}

#[derive(Debug)]
struct Page {
    no: u64,
    path: PathBuf,
    nonce: u128,
    /// Ciphertext image (plaintext image when encryption is off).
    image: Vec<u8>,
    next: usize,
    space: usize,
    used: u32,
}

impl Page {
    /// Bump-pointer allocation; `None` closes the page.
    fn alloc(&mut self, footprint: usize) -> Option<usize> {
        if footprint <= self.space {
            let offset = self.next;
            self.next += footprint;
            self.space -= footprint;
            self.used += 1;
            Some(offset)
        } else {
            self.close();
            None
        }
    }

    /// Write the end-of-chain sentinel for recovery.
    fn close(&mut self) {
        if self.space >= BH_SIZE {
            self.image[self.next..self.next + BH_SIZE].fill(0);
        }
    }

    fn persist(&self) -> std::io::Result<()> {
        let mut f = fs::File::create(&self.path)?;
        f.write_all(&self.image)
    }
}

/// Location of a page buffer.
#[derive(Debug, Clone, Copy)]
struct PageSlot {
    page_no: u64,
    offset: usize,
    payload: usize,
}

/// The page store.
pub struct PageStore {
    dir: PathBuf,
    encrypt_cb: Option<EncryptCb>,
    enc_key: Vec<u8>,
    nonce: u128,
    keep_size: usize,
    page_size: usize,
    keep_page: bool,
    count: u64,
    total_size: usize,
    pages: VecDeque<Page>,
    current: Option<u64>,
    slots: HashMap<BufferId, PageSlot>,
    reaper: Arc<dyn PageReaper>,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("dir", &self.dir)
            .field("pages", &self.pages.len())
            .field("total_size", &self.total_size)
            .field("count", &self.count)
            .field("encrypted", &self.encrypt_cb.is_some())
            .finish_non_exhaustive()
    }
}

impl PageStore {
    /// Create a page store rooted at `dir`.
    pub fn new(
        dir: &Path,
        encrypt_cb: Option<EncryptCb>,
        keep_size: usize,
        page_size: usize,
        keep_page: bool,
        reaper: Arc<dyn PageReaper>,
    ) -> Self {
        Self {
            dir: dir.to_owned(),
            encrypt_cb,
            enc_key: Vec::new(),
            nonce: rand::random::<u128>(),
            keep_size,
            page_size,
            keep_page,
            count: 0,
            total_size: 0,
            pages: VecDeque::new(),
            current: None,
            slots: HashMap::new(),
            reaper,
        }
    }

    /// Total bytes in page files.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of live pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Whether the keep window is exceeded.
    #[must_use]
    pub fn cleanup_needed(&self) -> bool {
        self.total_size > self.keep_size
            && self.pages.len() > usize::from(self.keep_page)
    }

    /// Rotate the at-rest key. A fresh page is created immediately so its
    /// key record is protected by the new key.
    pub fn set_enc_key(&mut self, key: Vec<u8>) -> Result<()> {
        self.new_page(0, key.clone())?;
        self.enc_key = key;
        Ok(())
    }

    /// Allocate `payload` bytes; creates a new page when the current one
    /// cannot satisfy the allocation.
    pub fn alloc(&mut self, id: BufferId, payload: usize) -> Result<usize> {
        let footprint = bh_size(payload);

        let offset = self
            .current_page()
            .and_then(|p| p.alloc(footprint));
        let offset = match offset {
            Some(o) => o,
            None => {
                self.new_page(footprint, self.enc_key.clone())?;
                self.current_page()
                    .and_then(|p| p.alloc(footprint))
                    .expect("fresh page satisfies its sizing allocation")
            }
        };

        let page_no = self.current.expect("current page exists after alloc");
        self.slots.insert(
            id,
            PageSlot {
                page_no,
                offset,
                payload,
            },
        );
        Ok(offset)
    }

    /// Grow/shrink the latest allocation of the current page in place.
    pub fn resize_tail(&mut self, id: BufferId, payload: usize) -> bool {
        let Some(slot) = self.slots.get(&id).copied() else {
            return false;
        };
        if Some(slot.page_no) != self.current {
            return false;
        }
        let old_footprint = bh_size(slot.payload);
        let new_footprint = bh_size(payload);
        let Some(page) = self.page_mut(slot.page_no) else {
            return false;
        };
        // Only the most recent allocation sits flush against the bump
        // pointer.
        if page.next != slot.offset + old_footprint {
            return false;
        }
        if new_footprint > old_footprint {
            let growth = new_footprint - old_footprint;
            if growth > page.space {
                return false;
            }
            page.space -= growth;
            page.next += growth;
        } else {
            let shrink = old_footprint - new_footprint;
            page.space += shrink;
            page.next -= shrink;
        }
        self.slots.insert(
            id,
            PageSlot {
                page_no: slot.page_no,
                offset: slot.offset,
                payload,
            },
        );
        true
    }

    /// Write a buffer through to its page, encrypting the payload when a
    /// callback is installed.
    pub fn flush(&mut self, id: BufferId, bh: &BufferHeader, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(bh.store, StoreTag::Page);
        let Some(slot) = self.slots.get(&id).copied() else {
            return Ok(());
        };
        let stored = match &self.encrypt_cb {
            Some(cb) => {
                let page = self.page(slot.page_no).expect("slot page exists");
                let iv = iv_at(page.nonce, u64::try_from(slot.offset).unwrap_or(u64::MAX));
                apply_whole(cb, &self.enc_key, iv, payload, EncDirection::Encrypt)?
            }
            None => payload.to_vec(),
        };
        let Some(page) = self.page_mut(slot.page_no) else {
            return Ok(());
        };
        let start = slot.offset;
        page.image[start..start + BH_SIZE].copy_from_slice(&bh.to_bytes());
        page.image[start + BH_SIZE..start + BH_SIZE + stored.len()].copy_from_slice(&stored);
        Ok(())
    }

    /// Update only the stored header.
    pub fn flush_header(&mut self, id: BufferId, bh: &BufferHeader) {
        if let Some(slot) = self.slots.get(&id).copied() {
            if let Some(page) = self.page_mut(slot.page_no) {
                let start = slot.offset;
                page.image[start..start + BH_SIZE].copy_from_slice(&bh.to_bytes());
            }
        }
    }

    /// Read (and decrypt) a buffer's payload.
    pub fn bytes(&self, id: BufferId) -> Result<Option<Vec<u8>>> {
        let Some(slot) = self.slots.get(&id).copied() else {
            return Ok(None);
        };
        let Some(page) = self.page(slot.page_no) else {
            return Ok(None);
        };
        let start = slot.offset + BH_SIZE;
        let stored = &page.image[start..start + slot.payload];
        let plain = match &self.encrypt_cb {
            Some(cb) => {
                let iv = iv_at(page.nonce, u64::try_from(slot.offset).unwrap_or(u64::MAX));
                apply_whole(cb, &self.enc_key, iv, stored, EncDirection::Decrypt)?
            }
            None => stored.to_vec(),
        };
        Ok(Some(plain))
    }

    /// Whether this store holds `id`.
    #[must_use]
    pub fn contains(&self, id: BufferId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Discard a buffer, dropping the page's reference count and cleaning
    /// up fully unreferenced pages.
    pub fn discard(&mut self, id: BufferId) {
        if let Some(slot) = self.slots.remove(&id) {
            if let Some(page) = self.page_mut(slot.page_no) {
                debug_assert!(page.used > 0);
                page.used -= 1;
            }
        }
        self.cleanup();
    }

    /// Delete unreferenced front pages while the keep window is exceeded.
    pub fn cleanup(&mut self) {
        while self.cleanup_needed() && self.delete_front_page() {}
    }

    /// Delete all deletable pages (shutdown path).
    pub fn reset(&mut self) {
        while !self.pages.is_empty() && self.delete_front_page() {}
    }

    /// Persist every page image to disk.
    pub fn persist(&self) -> Result<()> {
        for page in &self.pages {
            page.persist()?;
        }
        Ok(())
    }

    fn delete_front_page(&mut self) -> bool {
        let Some(front) = self.pages.front() else {
            return false;
        };
        if front.used > 0 {
            return false;
        }
        let page = self.pages.pop_front().expect("checked non-empty");
        self.total_size -= page.image.len();
        if self.current == Some(page.no) {
            self.current = None;
        }
        debug!(path = %page.path.display(), "retiring page");
        self.reaper.unlink(page.path);
        true
    }

    fn page(&self, no: u64) -> Option<&Page> {
        self.pages.iter().find(|p| p.no == no)
    }

    fn page_mut(&mut self, no: u64) -> Option<&mut Page> {
        self.pages.iter_mut().find(|p| p.no == no)
    }

    fn current_page(&mut self) -> Option<&mut Page> {
        let current = self.current?;
        self.page_mut(current)
    }

    /// Create a page large enough for `size` and record the key record in
    /// it. The page file is created eagerly with the nonce header.
    fn new_page(&mut self, size: usize, key: Vec<u8>) -> Result<()> {
        let key_record = bh_size(self.enc_key.len());
        let meta = align_up(IV_SIZE) + key_record;
        let min_size = meta + align_up(size);
        let page_bytes = self.page_size.max(min_size);

        let path = self.dir.join(format!("{PAGE_BASE_NAME}{:06}", self.count));
        let nonce = self.nonce;
        self.nonce = self.nonce.wrapping_add(page_bytes as u128);

        let mut image = vec![0u8; page_bytes];
        image[..IV_SIZE].copy_from_slice(&nonce.to_le_bytes());

        let mut page = Page {
            no: self.count,
            path: path.clone(),
            nonce,
            image,
            next: align_up(IV_SIZE),
            space: page_bytes - align_up(IV_SIZE),
            used: 0,
        };

        // Key record: a released buffer holding the previous key,
        // protected by this page's key. Recovery walks these records to
        // reconstruct the key chain.
        let offset = page
            .alloc(key_record)
            .expect("fresh page fits its key record");
        let mut bh = BufferHeader::new(
            u32::try_from(self.enc_key.len()).expect("key length fits u32"),
            StoreTag::Page,
        );
        bh.release();
        let prev_key = self.enc_key.clone();
        let record = match &self.encrypt_cb {
            Some(cb) if !prev_key.is_empty() => {
                let iv = iv_at(nonce, u64::try_from(offset).unwrap_or(u64::MAX));
                apply_whole(cb, &key, iv, &prev_key, EncDirection::Encrypt)?
            }
            _ => prev_key,
        };
        page.image[offset..offset + BH_SIZE].copy_from_slice(&bh.to_bytes());
        page.image[offset + BH_SIZE..offset + BH_SIZE + record.len()].copy_from_slice(&record);
        page.used -= 1; // the key record never pins the page

        info!(path = %path.display(), size = page_bytes, "created page");
        page.persist()?;

        self.total_size += page_bytes;
        self.current = Some(page.no);
        self.count += 1;
        self.pages.push_back(page);
        Ok(())
    }
}
