//! The certification engine.

use std::collections::HashMap;

use fgalera_types::{KeyStrength, Seqno};
use fgalera_writeset::WriteSetIn;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::index::CertIndex;
use crate::nbo::{NboCtx, NboKey};

/// Certification verdict. FAILED is a normal outcome, not an error: the
/// caller interprets it as transaction abort and self-cancels the apply
/// and commit monitors for the seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    /// Certified; enter the apply monitor with the computed dependency.
    Ok,
    /// Certified out; the transaction must roll back everywhere.
    Failed,
}

/// Result of certifying one write-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertOutcome {
    /// Verdict.
    pub result: TestResult,
    /// Largest seqno this write-set must wait for before applying.
    pub depends: Seqno,
    /// For an NBO end: the begin seqno whose context it closes.
    pub ends_nbo: Option<Seqno>,
}

/// What one index hit means for the incoming write-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ignore,
    Depend,
    Conflict,
}

/// Cross-source outcome for `(incoming, existing)` strengths.
///
/// Shared and reference reads ignore each other; updates collide with
/// updates; exclusives collide with everything that asserts coherence.
/// An exclusive over a plain shared read is only a dependency: shared
/// reads advertise no coherence to invalidate.
fn cross_source(incoming: KeyStrength, existing: KeyStrength) -> Outcome {
    use KeyStrength::{Exclusive, Reference, Shared, Update};
    match (incoming, existing) {
        (Shared | Reference, Shared | Reference) => Outcome::Ignore,
        (Shared | Reference, Update) | (Update, Shared | Reference) | (Exclusive, Shared) => {
            Outcome::Depend
        }
        _ => Outcome::Conflict,
    }
}

struct Inner {
    version: u8,
    position: Seqno,
    safe_to_discard: Seqno,
    index: CertIndex,
    nbo: HashMap<Seqno, NboCtx>,
    trx_count: u64,
    failed_count: u64,
}

/// The conflict detector shared by the receiver threads.
pub struct Certification {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Certification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Certification")
            .field("version", &inner.version)
            .field("position", &inner.position)
            .field("index_keys", &inner.index.len())
            .field("active_nbo", &inner.nbo.len())
            .finish_non_exhaustive()
    }
}

impl Certification {
    /// New engine at an undefined position; call
    /// [`Self::assign_initial_position`] before feeding write-sets.
    #[must_use]
    pub fn new(version: u8) -> Self {
        Self {
            inner: Mutex::new(Inner {
                version,
                position: Seqno::NONE,
                safe_to_discard: Seqno::NONE,
                index: CertIndex::new(),
                nbo: HashMap::new(),
                trx_count: 0,
                failed_count: 0,
            }),
        }
    }

    /// (Re)initialize at `position` with a fresh index.
    pub fn assign_initial_position(&self, position: Seqno, version: u8) {
        let mut inner = self.inner.lock();
        debug!(%position, version, "assigning initial certification position");
        inner.version = version;
        inner.position = position;
        inner.safe_to_discard = position;
        inner.index.clear();
        inner.nbo.clear();
    }

    /// Last certified seqno.
    pub fn position(&self) -> Seqno {
        self.inner.lock().position
    }

    /// Number of live key fingerprints in the index.
    pub fn index_size(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Certify the write-set delivered at `g`.
    ///
    /// Write-sets must be fed in delivery order; the verdict is a pure
    /// function of the bytes and the index state.
    pub fn append_trx(&self, ws: &WriteSetIn, g: Seqno) -> CertOutcome {
        let mut inner = self.inner.lock();
        assert!(
            g > inner.position,
            "write-set at {g} delivered behind certification position {}",
            inner.position
        );
        inner.position = g;
        inner.trx_count += 1;

        let is_toi = ws.is_toi();
        let ends_nbo = if ws.is_nbo_end() {
            match NboKey::parse(&ws.data) {
                Ok(key) => Some(key.0),
                Err(e) => {
                    warn!(%g, error = %e, "nbo end without a parseable key");
                    None
                }
            }
        } else {
            None
        };

        let mut depends = Seqno::NONE;
        let mut failed = false;

        // A total-order write-set can only fail against an active
        // non-blocking operation holding one of its keys.
        if is_toi {
            let intersecting = inner.nbo.values().any(|ctx| {
                Some(ctx.begin) != ends_nbo
                    && ctx.intersects(ws.keys.iter().map(|k| &k.fingerprint))
            });
            if intersecting {
                trace!(%g, "total-order write-set blocked by active NBO");
                failed = true;
            }
        }

        // Scan the index. A cross-source collision fails the write-set and
        // stops the scan; same-source collisions degrade to dependencies.
        if !failed {
            'scan: for part in &ws.keys {
                let Some(slot) = inner.index.get(part.fingerprint) else {
                    continue;
                };
                for (strength, key_ref) in slot.strongest_first() {
                    if key_ref.seqno <= ws.last_seen {
                        // Already seen by the writer; dependency only.
                        depends = depends.max_with(key_ref.seqno);
                        continue;
                    }
                    let outcome = if key_ref.source == ws.source || is_toi {
                        match cross_source(part.prefix, strength) {
                            Outcome::Conflict => Outcome::Depend,
                            other => other,
                        }
                    } else {
                        cross_source(part.prefix, strength)
                    };
                    match outcome {
                        Outcome::Ignore => {}
                        Outcome::Depend => depends = depends.max_with(key_ref.seqno),
                        Outcome::Conflict => {
                            trace!(
                                %g,
                                against = %key_ref.seqno,
                                incoming = %part.prefix,
                                existing = %strength,
                                "certification conflict"
                            );
                            depends = depends.max_with(key_ref.seqno);
                            failed = true;
                            break 'scan;
                        }
                    }
                }
            }
        }

        if failed {
            inner.failed_count += 1;
        } else {
            // Only write-sets that pass leave a trace in the index.
            let source = ws.source;
            inner.index.insert(
                g,
                source,
                ws.keys.iter().map(|k| (k.fingerprint, k.prefix)),
            );
            if ws.is_nbo_begin() {
                inner.nbo.insert(
                    g,
                    NboCtx::new(g, source, ws.keys.iter().map(|k| k.fingerprint).collect()),
                );
                debug!(%g, "installed NBO context");
            }
        }

        // Total-order and parallel-apply-unsafe write-sets apply strictly
        // serially.
        if is_toi || ws.is_pa_unsafe() {
            depends = g.prev();
        }
        depends = Seqno(depends.get().min(g.prev().get()));

        CertOutcome {
            result: if failed { TestResult::Failed } else { TestResult::Ok },
            depends,
            ends_nbo,
        }
    }

    /// Erase the context installed by the NBO begin at `begin`. Called once
    /// the matching end has been applied.
    pub fn erase_nbo_ctx(&self, begin: Seqno) {
        let mut inner = self.inner.lock();
        if inner.nbo.remove(&begin).is_none() {
            warn!(%begin, "no NBO context to erase");
        }
    }

    /// Number of active NBO contexts.
    pub fn nbo_size(&self) -> usize {
        self.inner.lock().nbo.len()
    }

    /// Note a committed transaction; advances the trim candidate.
    pub fn set_trx_committed(&self, g: Seqno) {
        let mut inner = self.inner.lock();
        if g > inner.safe_to_discard {
            inner.safe_to_discard = g;
        }
    }

    /// Evict index entries inserted by write-sets at or below `g`.
    /// Eviction is lazy: callers drive it from the service thread.
    pub fn purge_trxs_upto(&self, g: Seqno) {
        let mut inner = self.inner.lock();
        let horizon = Seqno(g.get().min(inner.safe_to_discard.get()));
        inner.index.purge_upto(horizon);
    }

    /// `(certified, failed)` counters.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.trx_count, inner.failed_count)
    }

    /// Protocol version in force.
    pub fn version(&self) -> u8 {
        self.inner.lock().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_is_the_documented_one() {
        use KeyStrength::{Exclusive, Reference, Shared, Update};
        use Outcome::{Conflict, Depend, Ignore};

        let expect = [
            ((Shared, Shared), Ignore),
            ((Shared, Reference), Ignore),
            ((Shared, Update), Depend),
            ((Shared, Exclusive), Conflict),
            ((Reference, Shared), Ignore),
            ((Reference, Reference), Ignore),
            ((Reference, Update), Depend),
            ((Reference, Exclusive), Conflict),
            ((Update, Shared), Depend),
            ((Update, Reference), Depend),
            ((Update, Update), Conflict),
            ((Update, Exclusive), Conflict),
            ((Exclusive, Shared), Depend),
            ((Exclusive, Reference), Conflict),
            ((Exclusive, Update), Conflict),
            ((Exclusive, Exclusive), Conflict),
        ];
        for ((incoming, existing), outcome) in expect {
            assert_eq!(
                cross_source(incoming, existing),
                outcome,
                "{incoming} vs {existing}"
            );
        }
    }
}
