//! The background service thread.
//!
//! A single worker drains three kinds of jobs: last-applied reports to the
//! transport, ordered buffer releases (which must reach the cache strictly
//! in seqno order, whatever order the appliers finish in), and page-file
//! unlink requests from the cache's page store.
//!
//! Construction is two-phase: the queue (and hence the page reaper) exists
//! before the cache, the worker starts once the cache does.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use fgalera_gcache::page_store::PageReaper;
use fgalera_gcache::{BufferId, GCache};
use fgalera_types::Seqno;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::transport::Transport;

enum Job {
    /// Release the ordered buffer once the release frontier reaches it.
    Release { seqno: Seqno, buffer: BufferId },
    /// Report the last locally applied seqno to the transport.
    LastApplied(Seqno),
    /// Unlink a retired page file.
    UnlinkPage(PathBuf),
    Shutdown,
}

/// Handle to the service thread.
pub struct ServiceThread {
    tx: Sender<Job>,
    rx: Mutex<Option<Receiver<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServiceThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceThread")
            .field("running", &self.worker.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ServiceThread {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceThread {
    /// Create the queue; the worker is not running yet.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel::<Job>();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker. `next_release` is the first seqno the release
    /// frontier expects (initial position + 1).
    pub fn start(&self, cache: Arc<GCache>, transport: Arc<dyn Transport>, next_release: Seqno) {
        let rx = self
            .rx
            .lock()
            .take()
            .expect("service thread started exactly once");
        let worker = std::thread::Builder::new()
            .name("galera-service".to_owned())
            .spawn(move || run_worker(&rx, &cache, transport.as_ref(), next_release))
            .expect("service thread spawns");
        *self.worker.lock() = Some(worker);
    }

    /// Queue an ordered release.
    pub fn release(&self, seqno: Seqno, buffer: BufferId) {
        let _ = self.tx.send(Job::Release { seqno, buffer });
    }

    /// Queue a last-applied report.
    pub fn report_last_applied(&self, seqno: Seqno) {
        let _ = self.tx.send(Job::LastApplied(seqno));
    }

    /// Stop the worker and wait for it to drain.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Job::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("service thread panicked");
            }
        }
    }

    /// A [`PageReaper`] that unlinks page files on this thread.
    #[must_use]
    pub fn reaper(&self) -> Arc<dyn PageReaper> {
        Arc::new(ChannelReaper {
            tx: self.tx.clone(),
        })
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    rx: &Receiver<Job>,
    cache: &GCache,
    transport: &dyn Transport,
    mut next: Seqno,
) {
    let mut pending: BTreeMap<Seqno, BufferId> = BTreeMap::new();
    while let Ok(job) = rx.recv() {
        match job {
            Job::Release { seqno, buffer } => {
                pending.insert(seqno, buffer);
                let before = next;
                while let Some(buffer) = pending.remove(&next) {
                    if let Err(e) = cache.free(buffer) {
                        error!(%next, error = %e, "ordered release failed");
                    }
                    next = next.next();
                }
                if next > before {
                    cache.seqno_release(next.prev());
                }
            }
            Job::LastApplied(seqno) => {
                transport.report_last_applied(seqno);
            }
            Job::UnlinkPage(path) => match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "deleted page"),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to remove page file");
                }
            },
            Job::Shutdown => break,
        }
    }
    debug!(pending = pending.len(), "service thread drained");
}

struct ChannelReaper {
    tx: Sender<Job>,
}

impl PageReaper for ChannelReaper {
    fn unlink(&self, path: PathBuf) {
        if self.tx.send(Job::UnlinkPage(path.clone())).is_err() {
            // Worker already gone; remove inline.
            let _ = fs::remove_file(path);
        }
    }
}
