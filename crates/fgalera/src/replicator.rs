//! The replication pipeline front object.
//!
//! Wires the cache, the certification engine, and the three ordering
//! monitors into the operation sequence the database service drives:
//!
//! ```text
//! replicate  → total order assigned, local monitor entered
//! pre_commit → certified, apply monitor entered (parallel by dependency)
//! commit_enter → apply monitor left, commit monitor entered (serial)
//! post_commit  → commit monitor left, buffer released in order
//! ```
//!
//! A write-set that fails certification or is broken-first aborted instead
//! self-cancels the monitors it never entered, so the frontiers stay
//! contiguous on every node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use fgalera_cert::{CertOutcome, Certification, TestResult};
use fgalera_error::{ensure_len, GaleraError, Result};
use fgalera_gcache::{BufferId, BufferInfo, EncryptCb, GCache};
use fgalera_keyset::KeyData;
use fgalera_monitor::{
    ApplyOrder, CommitOrder, LocalOrder, OrderedMonitor, WriteSetWaiters,
};
use fgalera_types::{
    ActionType, ConnId, KeyStrength, LocalSeqno, NodeId, Params, Seqno, TrxId, WsFlags,
};
use fgalera_writeset::{Defrag, FragOutcome, Fragment, WriteSetIn, WriteSetOut};

use crate::service::ServiceThread;
use crate::transport::Transport;

/// Replicator construction parameters.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// This node's identity.
    pub node_id: NodeId,
    /// Write-set protocol version to produce.
    pub ws_version: u8,
    /// Cache configuration.
    pub params: Params,
    /// Position to start ordering from (0 for a fresh group).
    pub initial_position: Seqno,
}

/// A transaction under construction on this node.
#[derive(Debug)]
pub struct TrxHandle {
    conn_id: ConnId,
    trx_id: TrxId,
    ws: WriteSetOut,
}

impl TrxHandle {
    /// Append one key the transaction touched.
    pub fn append_key(&mut self, parts: &[&[u8]], strength: KeyStrength) {
        self.ws.append_key(&KeyData::new(parts, strength));
    }

    /// Append an explicit zero-level key.
    pub fn append_zero_level(&mut self, strength: KeyStrength) {
        self.ws.append_key(&KeyData::zero_level(strength));
    }

    /// Append payload for the database service on the other nodes.
    pub fn append_data(&mut self, bytes: &[u8]) {
        self.ws.append_data(bytes);
    }

    /// Replace the flag word.
    pub fn set_flags(&mut self, flags: WsFlags) {
        self.ws.set_flags(flags);
    }

    /// Transaction id.
    #[must_use]
    pub fn trx_id(&self) -> TrxId {
        self.trx_id
    }
}

/// A write-set with an assigned position in the total order.
#[derive(Debug, Clone)]
pub struct OrderedTrx {
    /// Global seqno.
    pub global: Seqno,
    /// Local delivery ordinal.
    pub local: LocalSeqno,
    /// Cache buffer holding the serialized bytes.
    pub buffer: BufferId,
    /// Parsed write-set.
    pub ws: WriteSetIn,
    /// Certification outcome, set by [`Replicator::pre_commit`].
    pub outcome: Option<CertOutcome>,
}

struct OrderState {
    global: Seqno,
    local: LocalSeqno,
}

/// The replication core.
pub struct Replicator {
    node_id: NodeId,
    ws_version: u8,
    cache: Arc<GCache>,
    cert: Certification,
    local_monitor: OrderedMonitor<LocalOrder>,
    apply_monitor: OrderedMonitor<ApplyOrder>,
    commit_monitor: OrderedMonitor<CommitOrder>,
    waiters: WriteSetWaiters,
    service: ServiceThread,
    transport: Arc<dyn Transport>,
    order: Mutex<OrderState>,
    /// Per-source fragment reassembly state.
    defrags: Mutex<HashMap<NodeId, Defrag>>,
    delivered: Mutex<HashMap<(NodeId, TrxId), OrderedTrx>>,
    trx_counter: AtomicU64,
    act_counter: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("node_id", &self.node_id)
            .field("position", &self.cert.position())
            .field("last_committed", &self.commit_monitor.last_left())
            .finish_non_exhaustive()
    }
}

impl Replicator {
    /// Open the replication core and start its service thread.
    pub fn open(
        config: &ReplicatorConfig,
        transport: Arc<dyn Transport>,
        encrypt_cb: Option<EncryptCb>,
    ) -> Result<Arc<Self>> {
        let service = ServiceThread::new();
        let cache = Arc::new(GCache::new(
            &config.params,
            encrypt_cb,
            Some(service.reaper()),
        )?);
        service.start(
            Arc::clone(&cache),
            Arc::clone(&transport),
            config.initial_position.next(),
        );

        let cert = Certification::new(config.ws_version);
        cert.assign_initial_position(config.initial_position, config.ws_version);

        info!(
            node = %config.node_id,
            position = %config.initial_position,
            "replication core open"
        );
        Ok(Arc::new(Self {
            node_id: config.node_id,
            ws_version: config.ws_version,
            cache,
            cert,
            local_monitor: OrderedMonitor::new(config.initial_position),
            apply_monitor: OrderedMonitor::new(config.initial_position),
            commit_monitor: OrderedMonitor::new(config.initial_position),
            waiters: WriteSetWaiters::new(),
            service,
            transport,
            order: Mutex::new(OrderState {
                global: config.initial_position,
                local: LocalSeqno::NONE,
            }),
            defrags: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
            trx_counter: AtomicU64::new(0),
            act_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The cache owning all write-set buffers.
    #[must_use]
    pub fn cache(&self) -> &Arc<GCache> {
        &self.cache
    }

    /// Highest committed seqno.
    pub fn last_committed(&self) -> Seqno {
        self.commit_monitor.last_left()
    }

    /// Start a transaction.
    pub fn trx_begin(&self, conn_id: ConnId) -> Result<TrxHandle> {
        Ok(TrxHandle {
            conn_id,
            trx_id: TrxId(self.trx_counter.fetch_add(1, Ordering::Relaxed) + 1),
            ws: WriteSetOut::new(self.ws_version, WsFlags::BEGIN | WsFlags::COMMIT)?,
        })
    }

    /// Serialize the transaction, push it through the transport, and wait
    /// until its write-set comes back in total order and the local monitor
    /// admits it.
    pub fn replicate(&self, mut trx: TrxHandle) -> Result<OrderedTrx> {
        self.ensure_open()?;

        // Every replicated transaction carries the implicit zero-level
        // key; rolled-back no-ops carry nothing.
        if !trx.ws.flags().contains(WsFlags::ROLLBACK) {
            trx.ws.append_key(&KeyData::default_zero_level());
        }

        let mut gather = trx.ws.gather(self.node_id, trx.conn_id, trx.trx_id);
        gather.finalize(self.cert.position());
        let mut bytes = vec![0u8; gather.size()];
        gather.serialize(&mut bytes)?;

        let waiter = self.waiters.register(self.node_id, trx.trx_id);
        if let Err(e) = self.transport.send(bytes) {
            self.waiters.unregister(self.node_id, trx.trx_id);
            return Err(e);
        }
        let interrupted = waiter.wait();
        self.waiters.unregister(self.node_id, trx.trx_id);
        if interrupted {
            return Err(GaleraError::Interrupted);
        }

        let ordered = self
            .take_delivered(self.node_id, trx.trx_id)
            .ok_or(GaleraError::ConnectionAborted)?;
        self.enter_local(&ordered)?;
        Ok(ordered)
    }

    /// Transport-facing delivery of one unfragmented action: routed
    /// through the defragmenter as an action of a single fragment.
    ///
    /// The transport envelope names the sender; for a whole action the
    /// source field sits at its fixed offset in the write-set header.
    pub fn deliver(&self, bytes: &[u8]) -> Result<()> {
        ensure_len(bytes, 24)?;
        let mut source = [0u8; 16];
        source.copy_from_slice(&bytes[8..24]);
        let frg = Fragment {
            act_id: self.act_counter.fetch_add(1, Ordering::Relaxed) + 1,
            frag_no: 0,
            act_size: bytes.len(),
            bytes,
        };
        self.deliver_fragment(NodeId::from_bytes(source), &frg)
    }

    /// Transport-facing delivery of one action fragment from `source`.
    ///
    /// Fragments are fed through the per-source defragmenter; once an
    /// action is whole, it is assigned the next position in the total
    /// order. A local action completing in reset state is delivered all
    /// the same (the flag-based recovery path).
    pub fn deliver_fragment(&self, source: NodeId, frg: &Fragment<'_>) -> Result<()> {
        self.ensure_open()?;

        let local = source == self.node_id;
        let outcome = {
            let mut defrags = self.defrags.lock();
            let df = defrags
                .entry(source)
                .or_insert_with(|| Defrag::new(Arc::clone(&self.cache)));
            df.handle_frag(frg, local)?
        };
        match outcome {
            FragOutcome::Continue | FragOutcome::Skipped => Ok(()),
            FragOutcome::Complete { id, size } => self.deliver_action(id, size),
            FragOutcome::Restart { id, size } => {
                debug!(%source, "restarted local action delivered");
                self.deliver_action(id, size)
            }
        }
    }

    /// Order one reassembled action: assign the next global seqno to its
    /// buffer and park the parsed write-set for its processor. The
    /// submitter of a local write-set is woken through the waiter
    /// registry.
    fn deliver_action(&self, buffer: BufferId, size: usize) -> Result<()> {
        let (global, local) = {
            let mut order = self.order.lock();
            let global = order.global.next();
            let local = order.local.next();
            self.cache
                .seqno_assign(buffer, global, ActionType::WriteSet.as_byte(), false)?;
            order.global = global;
            order.local = local;
            (global, local)
        };

        let ws = match WriteSetIn::unserialize(&self.cache, buffer, size) {
            Ok(ws) => ws,
            Err(e) => {
                // The seqno is consumed either way; a malformed frame still
                // has to move through the release chain.
                self.local_monitor.self_cancel(global);
                self.apply_monitor.self_cancel(global);
                self.commit_monitor.self_cancel(global);
                self.service.release(global, buffer);
                return Err(e);
            }
        };
        // Buffers may sit in the slave queue for a while; no reason to
        // retain plaintext for them.
        self.cache.drop_plaintext(buffer);

        trace!(%global, source = %ws.source, trx = %ws.trx_id, "delivered");
        let key = (ws.source, ws.trx_id);
        self.delivered.lock().insert(
            key,
            OrderedTrx {
                global,
                local,
                buffer,
                ws,
                outcome: None,
            },
        );
        self.waiters.signal(key.0, key.1);
        Ok(())
    }

    /// Claim a delivered write-set for processing.
    pub fn take_delivered(&self, source: NodeId, trx_id: TrxId) -> Option<OrderedTrx> {
        self.delivered.lock().remove(&(source, trx_id))
    }

    /// Enter the local monitor at the write-set's seqno.
    pub fn enter_local(&self, ordered: &OrderedTrx) -> Result<()> {
        self.local_monitor.enter(ordered.global, Seqno::NONE)
    }

    /// Certify and, on success, enter the apply monitor.
    ///
    /// Must be called in total order (the caller holds the local monitor).
    /// On a FAILED verdict the apply and commit monitors are self-cancelled
    /// and the buffer is queued for ordered release; the caller rolls the
    /// transaction back.
    pub fn pre_commit(&self, ordered: &mut OrderedTrx) -> Result<TestResult> {
        let g = ordered.global;
        let outcome = self.cert.append_trx(&ordered.ws, g);
        ordered.outcome = Some(outcome);
        self.local_monitor.leave(g);

        match outcome.result {
            TestResult::Ok => {
                if let Err(e) = self.apply_monitor.enter(g, outcome.depends) {
                    debug!(%g, "apply admission interrupted");
                    self.apply_monitor.self_cancel(g);
                    self.commit_monitor.self_cancel(g);
                    self.service.release(g, ordered.buffer);
                    return Err(e);
                }
                Ok(TestResult::Ok)
            }
            TestResult::Failed => {
                debug!(%g, "certification failed");
                self.apply_monitor.self_cancel(g);
                self.commit_monitor.self_cancel(g);
                self.service.release(g, ordered.buffer);
                Ok(TestResult::Failed)
            }
        }
    }

    /// Leave the apply monitor and enter the serial commit monitor.
    pub fn commit_enter(&self, ordered: &OrderedTrx) -> Result<()> {
        let g = ordered.global;
        self.apply_monitor.leave(g);
        if let Err(e) = self.commit_monitor.enter(g, Seqno::NONE) {
            self.commit_monitor.self_cancel(g);
            self.service.release(g, ordered.buffer);
            return Err(e);
        }
        Ok(())
    }

    /// Finish the transaction: leave the commit monitor, mark it committed
    /// for the trim horizon, and queue the ordered release plus the
    /// last-applied report.
    pub fn post_commit(&self, ordered: &OrderedTrx) {
        let g = ordered.global;
        self.commit_monitor.leave(g);
        self.cert.set_trx_committed(g);
        if let Some(nbo_begin) = ordered.outcome.and_then(|o| o.ends_nbo) {
            self.cert.erase_nbo_ctx(nbo_begin);
        }
        self.service.release(g, ordered.buffer);
        self.service.report_last_applied(g);
    }

    /// Roll back an ordered transaction that never certified (local abort
    /// after `replicate`). Keeps all three frontiers contiguous.
    pub fn post_rollback(&self, ordered: &OrderedTrx) {
        let g = ordered.global;
        self.local_monitor.leave(g);
        self.apply_monitor.self_cancel(g);
        self.commit_monitor.self_cancel(g);
        self.service.release(g, ordered.buffer);
    }

    /// Begin a total-order-isolated operation on the given keys. Returns
    /// once every preceding write-set has been applied and the operation
    /// holds the commit order.
    pub fn to_execute_start(
        &self,
        conn_id: ConnId,
        keys: &[&[&[u8]]],
        data: &[u8],
    ) -> Result<OrderedTrx> {
        let mut trx = self.trx_begin(conn_id)?;
        trx.set_flags(WsFlags::BEGIN | WsFlags::COMMIT | WsFlags::ISOLATION);
        for parts in keys {
            trx.append_key(parts, KeyStrength::Exclusive);
        }
        if !data.is_empty() {
            trx.append_data(data);
        }

        let mut ordered = self.replicate(trx)?;
        let result = self.pre_commit(&mut ordered)?;
        assert_eq!(
            result,
            TestResult::Ok,
            "total-order operations never fail certification"
        );
        self.commit_enter(&ordered)?;
        Ok(ordered)
    }

    /// Finish a total-order-isolated operation.
    pub fn to_execute_end(&self, ordered: &OrderedTrx) {
        self.post_commit(ordered);
    }

    /// Issue a totally-ordered no-op probe and return its position: every
    /// write-set delivered before the call is at or below the returned
    /// seqno.
    pub fn causal_read(&self) -> Result<Seqno> {
        let mut trx = self.trx_begin(ConnId(0))?;
        trx.set_flags(WsFlags::ROLLBACK);
        let ordered = self.replicate(trx)?;
        let g = ordered.global;
        // A probe is never certified or applied.
        self.local_monitor.leave(g);
        self.apply_monitor.self_cancel(g);
        self.commit_monitor.self_cancel(g);
        self.service.release(g, ordered.buffer);
        Ok(g.prev())
    }

    /// Bulk snapshot read for the state-transfer sender: consecutive
    /// buffers from `start`, together with their payload bytes.
    pub fn snapshot_range(&self, start: Seqno, max: usize) -> Result<Vec<(BufferInfo, Vec<u8>)>> {
        let infos = self.cache.seqno_get_buffers(start, max);
        let mut out = Vec::with_capacity(infos.len());
        for info in infos {
            let plain = self.cache.get_ro_plaintext(info.id)?;
            let bytes = plain.read().clone();
            drop(plain);
            self.cache.drop_plaintext(info.id);
            out.push((info, bytes));
        }
        self.cache.seqno_unlock();
        Ok(out)
    }

    /// Access to the certification engine (monitoring, tests).
    #[must_use]
    pub fn cert(&self) -> &Certification {
        &self.cert
    }

    /// Block until every write-set at or below `g` has committed.
    pub fn drain_commits_upto(&self, g: Seqno) {
        self.commit_monitor.drain_upto(g);
    }

    /// Broken-first abort: wake the write-set at `g` out of whichever
    /// admission wait it is parked in with a cancelled outcome. The woken
    /// caller self-cancels the barriers it never entered.
    pub fn bf_abort(&self, g: Seqno) {
        self.apply_monitor.interrupt(g);
        self.commit_monitor.interrupt(g);
    }

    /// Close the provider: wake every parked thread with a cancelled
    /// outcome and stop the service thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.node_id, "closing replication core");
        self.waiters.interrupt_waiters();
        self.local_monitor.interrupt_waiters();
        self.apply_monitor.interrupt_waiters();
        self.commit_monitor.interrupt_waiters();
        self.service.shutdown();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(GaleraError::ConnectionAborted)
        } else {
            Ok(())
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.close();
    }
}
