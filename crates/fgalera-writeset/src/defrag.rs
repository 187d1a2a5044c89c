//! Per-source reassembly of fragmented write-sets.
//!
//! The transport splits large actions into fragments delivered in strict
//! `(action id, fragment number)` order per source. Fragments are copied
//! into a cache buffer sized to the announced total; on completion the
//! buffer ownership passes to the caller and the plaintext is dropped so
//! actions queued behind slow appliers do not retain decrypted memory.

use std::sync::Arc;

use fgalera_error::{GaleraError, Result};
use fgalera_gcache::shadow::PlainBuf;
use fgalera_gcache::{BufferId, GCache};
use tracing::{debug, error, warn};

/// One transport fragment.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    /// Source-scoped action id.
    pub act_id: u64,
    /// Fragment ordinal within the action, starting at 0.
    pub frag_no: u32,
    /// Total size of the reassembled action.
    pub act_size: usize,
    /// Fragment payload.
    pub bytes: &'a [u8],
}

/// Result of handling one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragOutcome {
    /// More fragments expected.
    Continue,
    /// Action fully reassembled; the buffer now belongs to the caller.
    Complete {
        /// Cache buffer holding the serialized action.
        id: BufferId,
        /// Reassembled size.
        size: usize,
    },
    /// A local action completed while flagged for restart: the sender
    /// thread abandoned it and will resend. The buffer still belongs to
    /// the caller, which decides whether to reuse or drop it.
    Restart {
        /// Cache buffer holding the serialized action.
        id: BufferId,
        /// Reassembled size.
        size: usize,
    },
    /// Fragment ignored (duplicate, or foreign fragment after a reset).
    Skipped,
}

/// Per-source defragmentation state.
pub struct Defrag {
    cache: Arc<GCache>,
    head: Option<BufferId>,
    plain: Option<Arc<PlainBuf>>,
    act_id: u64,
    frag_no: u32,
    size: usize,
    received: usize,
    reset: bool,
}

impl std::fmt::Debug for Defrag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Defrag")
            .field("act_id", &self.act_id)
            .field("frag_no", &self.frag_no)
            .field("size", &self.size)
            .field("received", &self.received)
            .field("reset", &self.reset)
            .finish_non_exhaustive()
    }
}

impl Defrag {
    /// Fresh state bound to a cache.
    #[must_use]
    pub fn new(cache: Arc<GCache>) -> Self {
        Self {
            cache,
            head: None,
            plain: None,
            act_id: 0,
            frag_no: 0,
            size: 0,
            received: 0,
            reset: false,
        }
    }

    /// Whether an action is partially assembled.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.received > 0
    }

    /// Whether the state was flagged for reset (local abort or
    /// configuration change).
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Flag the in-flight action as abandoned; the next first fragment of
    /// the same local action reinitializes the state.
    pub fn mark_reset(&mut self) {
        self.reset = true;
    }

    /// Handle one fragment. `local` marks fragments originating from this
    /// node.
    pub fn handle_frag(&mut self, frg: &Fragment<'_>, local: bool) -> Result<FragOutcome> {
        if self.received > 0 {
            // Another fragment of the action being assembled.
            self.frag_no += 1;

            if self.act_id != frg.act_id || self.frag_no != frg.frag_no {
                if local && self.reset && self.act_id == frg.act_id && frg.frag_no == 0 {
                    // The action was aborted halfway and is being resent by
                    // the sender thread. Reinitialize counters and continue
                    // with the new incarnation.
                    debug!(act_id = frg.act_id, size = frg.act_size, "local action reset");
                    self.frag_no = 0;
                    self.received = 0;
                    self.reset = false;
                    if self.size != frg.act_size {
                        self.size = frg.act_size;
                        let head = self.head.expect("in-progress action has a buffer");
                        let (new_head, plain) = self.cache.realloc(head, frg.act_size)?;
                        self.head = Some(new_head);
                        self.plain = Some(plain);
                    }
                } else if frg.act_id == self.act_id && frg.frag_no < self.frag_no {
                    // Tolerate duplicate fragments in production.
                    warn!(
                        act_id = frg.act_id,
                        frag_no = frg.frag_no,
                        expected = self.frag_no,
                        "duplicate fragment, skipping"
                    );
                    self.frag_no -= 1;
                    return Ok(FragOutcome::Skipped);
                } else {
                    error!(
                        expected_act = self.act_id,
                        expected_frag = self.frag_no,
                        act = frg.act_id,
                        frag = frg.frag_no,
                        "unordered fragment received"
                    );
                    let err = GaleraError::UnorderedFragment {
                        expected_action: self.act_id,
                        expected_frag: self.frag_no,
                        action: frg.act_id,
                        frag: frg.frag_no,
                    };
                    // Revert the counter in hope that a good fragment
                    // follows.
                    self.frag_no -= 1;
                    return Err(err);
                }
            }
        } else if frg.frag_no == 0 {
            // First fragment of a new action.
            self.size = frg.act_size;
            self.act_id = frg.act_id;
            self.frag_no = 0;
            self.reset = false;
            let (head, plain) = self.cache.malloc(frg.act_size)?;
            self.head = Some(head);
            self.plain = Some(plain);
        } else if !local && self.reset {
            // Can happen after a configuration change; ignore calmly.
            debug!(
                act_id = frg.act_id,
                frag_no = frg.frag_no,
                "ignoring foreign fragment after reset"
            );
            return Ok(FragOutcome::Skipped);
        } else {
            error!(
                act = frg.act_id,
                frag = frg.frag_no,
                "fragment does not start an action"
            );
            return Err(GaleraError::UnorderedFragment {
                expected_action: frg.act_id,
                expected_frag: 0,
                action: frg.act_id,
                frag: frg.frag_no,
            });
        }

        let end = self.received + frg.bytes.len();
        if end > self.size {
            error!(
                act = frg.act_id,
                frag = frg.frag_no,
                received = end,
                announced = self.size,
                "fragment overruns the announced action size"
            );
            let err = GaleraError::malformed(
                "fragment",
                format!("overruns the announced action size: {end} > {}", self.size),
            );
            // The assembly can never complete; drop it so a clean resend
            // of the action can start from fragment 0.
            self.plain = None;
            if let Some(head) = self.head.take() {
                let _ = self.cache.free(head);
            }
            self.init();
            return Err(err);
        }
        {
            let plain = self.plain.as_ref().expect("buffer allocated above");
            let mut bytes = plain.write();
            bytes[self.received..end].copy_from_slice(frg.bytes);
        }
        self.received += frg.bytes.len();

        if self.received == self.size {
            let id = self.head.take().expect("completed action has a buffer");
            let size = self.received;
            let restart = self.reset;
            self.plain = None;
            // The action may spend time in the slave queue; do not retain
            // plaintext for it.
            self.cache.drop_plaintext(id);
            self.init();
            if restart {
                debug_assert!(local, "only local actions complete in reset state");
                Ok(FragOutcome::Restart { id, size })
            } else {
                Ok(FragOutcome::Complete { id, size })
            }
        } else {
            Ok(FragOutcome::Continue)
        }
    }

    fn init(&mut self) {
        self.head = None;
        self.plain = None;
        self.act_id = 0;
        self.frag_no = 0;
        self.size = 0;
        self.received = 0;
        self.reset = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgalera_types::Params;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<GCache>) {
        let tmp = TempDir::new().unwrap();
        let params = Params {
            dir: tmp.path().to_owned(),
            cache_size: 1 << 16,
            ..Params::default()
        };
        let cache = Arc::new(GCache::new(&params, None, None).unwrap());
        (tmp, cache)
    }

    fn frag(act_id: u64, frag_no: u32, act_size: usize, bytes: &[u8]) -> Fragment<'_> {
        Fragment {
            act_id,
            frag_no,
            act_size,
            bytes,
        }
    }

    #[test]
    fn two_fragment_reassembly() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(Arc::clone(&cache));

        let out = df.handle_frag(&frag(1, 0, 8, b"abcd"), false).unwrap();
        assert_eq!(out, FragOutcome::Continue);
        assert!(df.in_progress());

        let out = df.handle_frag(&frag(1, 1, 8, b"efgh"), false).unwrap();
        let FragOutcome::Complete { id, size } = out else {
            panic!("expected completion, got {out:?}");
        };
        assert_eq!(size, 8);
        assert!(!df.in_progress());

        let plain = cache.get_ro_plaintext(id).unwrap();
        assert_eq!(&*plain.read(), b"abcdefgh");
    }

    #[test]
    fn first_fragment_must_be_zero() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(cache);
        let err = df.handle_frag(&frag(1, 1, 8, b"abcd"), false).unwrap_err();
        assert!(matches!(err, GaleraError::UnorderedFragment { .. }));
    }

    #[test]
    fn out_of_order_fragment_is_eproto() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(cache);
        df.handle_frag(&frag(1, 0, 12, b"abcd"), false).unwrap();
        let err = df.handle_frag(&frag(1, 2, 12, b"efgh"), false).unwrap_err();
        assert!(matches!(err, GaleraError::UnorderedFragment { .. }));

        // The counter was reverted: the expected fragment still lands.
        let out = df.handle_frag(&frag(1, 1, 12, b"efgh"), false).unwrap();
        assert_eq!(out, FragOutcome::Continue);
        let out = df.handle_frag(&frag(1, 2, 12, b"ijkl"), false).unwrap();
        assert!(matches!(out, FragOutcome::Complete { .. }));
    }

    #[test]
    fn duplicate_fragment_is_skipped() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(cache);
        df.handle_frag(&frag(1, 0, 12, b"abcd"), false).unwrap();
        df.handle_frag(&frag(1, 1, 12, b"efgh"), false).unwrap();

        let out = df.handle_frag(&frag(1, 1, 12, b"efgh"), false).unwrap();
        assert_eq!(out, FragOutcome::Skipped);

        let out = df.handle_frag(&frag(1, 2, 12, b"ijkl"), false).unwrap();
        assert!(matches!(out, FragOutcome::Complete { size: 12, .. }));
    }

    #[test]
    fn local_reset_restarts_with_new_size() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(Arc::clone(&cache));
        df.handle_frag(&frag(7, 0, 8, b"abcd"), true).unwrap();
        df.mark_reset();

        // Same local action resent from scratch with a different size.
        let out = df.handle_frag(&frag(7, 0, 4, b"wx"), true).unwrap();
        assert_eq!(out, FragOutcome::Continue);
        let out = df.handle_frag(&frag(7, 1, 4, b"yz"), true).unwrap();
        let FragOutcome::Complete { id, size } = out else {
            panic!("expected completion, got {out:?}");
        };
        assert_eq!(size, 4);
        let plain = cache.get_ro_plaintext(id).unwrap();
        assert_eq!(&*plain.read(), b"wxyz");
    }

    #[test]
    fn oversized_fragment_is_a_protocol_error() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(Arc::clone(&cache));

        // Announces 4 bytes but carries 8.
        let err = df
            .handle_frag(&frag(3, 0, 4, b"abcdefgh"), false)
            .unwrap_err();
        assert!(matches!(err, GaleraError::Malformed { .. }));
        assert!(!df.in_progress(), "poisoned assembly must be dropped");

        // A clean action still assembles from scratch.
        let out = df.handle_frag(&frag(4, 0, 4, b"wxyz"), false).unwrap();
        assert!(matches!(out, FragOutcome::Complete { size: 4, .. }));
    }

    #[test]
    fn overrun_on_continuation_is_a_protocol_error() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(cache);
        df.handle_frag(&frag(5, 0, 8, b"abcd"), false).unwrap();

        let err = df
            .handle_frag(&frag(5, 1, 8, b"efghijkl"), false)
            .unwrap_err();
        assert!(matches!(err, GaleraError::Malformed { .. }));
        assert!(!df.in_progress());
    }

    #[test]
    fn foreign_fragment_after_reset_is_ignored() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(cache);
        df.mark_reset();
        let out = df.handle_frag(&frag(9, 3, 16, b"abcd"), false).unwrap();
        assert_eq!(out, FragOutcome::Skipped);
    }

    #[test]
    fn completion_in_reset_state_reports_restart() {
        let (_tmp, cache) = setup();
        let mut df = Defrag::new(cache);
        df.handle_frag(&frag(5, 0, 8, b"abcd"), true).unwrap();
        df.mark_reset();
        let out = df.handle_frag(&frag(5, 1, 8, b"efgh"), true).unwrap();
        assert!(matches!(out, FragOutcome::Restart { size: 8, .. }));
        assert!(!df.is_reset(), "state reinitialized after completion");
    }
}
