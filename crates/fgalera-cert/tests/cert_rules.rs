//! Certification rule matrix and scenario tests.
//!
//! Each case feeds hand-built write-sets through the serialize/parse path
//! and asserts the verdict and dependency seqno the engine computes.

use fgalera_cert::{Certification, NboKey, TestResult};
use fgalera_types::{ConnId, KeyStrength, NodeId, Seqno, TrxId, WsFlags};
use fgalera_writeset::{WriteSetIn, WriteSetOut};

struct Fixture {
    cert: Certification,
    seqno: i64,
    trx_id: u64,
}

struct Appended {
    result: TestResult,
    depends: Seqno,
    seqno: Seqno,
    ends_nbo: Option<Seqno>,
}

impl Fixture {
    fn new() -> Self {
        let cert = Certification::new(5);
        cert.assign_initial_position(Seqno::NONE, 5);
        Self {
            cert,
            seqno: 0,
            trx_id: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn append_raw(
        &mut self,
        node: NodeId,
        conn: u64,
        last_seen: i64,
        key: &[&str],
        strength: KeyStrength,
        flags: WsFlags,
        data: &[u8],
        zero_level: Option<KeyStrength>,
    ) -> Appended {
        self.trx_id += 1;
        let mut out = WriteSetOut::new(5, flags).unwrap();
        if !key.is_empty() {
            let parts: Vec<&[u8]> = key.iter().map(|s| s.as_bytes()).collect();
            out.append_key(&fgalera_keyset::KeyData::new(&parts, strength));
        }
        if let Some(zl) = zero_level {
            out.append_key(&fgalera_keyset::KeyData::zero_level(zl));
        }
        if !data.is_empty() {
            out.append_data(data);
        }

        let mut gv = out.gather(node, ConnId(conn), TrxId(self.trx_id));
        gv.finalize(Seqno(last_seen));
        let mut buf = vec![0u8; gv.size()];
        gv.serialize(&mut buf).unwrap();
        let ws = WriteSetIn::parse(&buf).unwrap();

        self.seqno += 1;
        let g = Seqno(self.seqno);
        let outcome = self.cert.append_trx(&ws, g);
        self.cert.set_trx_committed(g);
        Appended {
            result: outcome.result,
            depends: outcome.depends,
            seqno: g,
            ends_nbo: outcome.ends_nbo,
        }
    }

    fn trx(
        &mut self,
        node: NodeId,
        last_seen: i64,
        key: &[&str],
        strength: KeyStrength,
    ) -> Appended {
        self.append_raw(
            node,
            1,
            last_seen,
            key,
            strength,
            WsFlags::BEGIN | WsFlags::COMMIT,
            &[],
            None,
        )
    }

    fn toi(
        &mut self,
        node: NodeId,
        last_seen: i64,
        key: &[&str],
        strength: KeyStrength,
    ) -> Appended {
        self.append_raw(
            node,
            1,
            last_seen,
            key,
            strength,
            WsFlags::BEGIN | WsFlags::COMMIT | WsFlags::ISOLATION,
            &[],
            None,
        )
    }

    fn nbo_begin(
        &mut self,
        node: NodeId,
        last_seen: i64,
        key: &[&str],
        strength: KeyStrength,
    ) -> Appended {
        self.append_raw(
            node,
            1,
            last_seen,
            key,
            strength,
            WsFlags::BEGIN | WsFlags::ISOLATION,
            &[],
            None,
        )
    }

    fn nbo_end(
        &mut self,
        node: NodeId,
        last_seen: i64,
        key: &[&str],
        strength: KeyStrength,
        begin: i64,
    ) -> Appended {
        let data = NboKey(Seqno(begin)).serialize();
        let res = self.append_raw(
            node,
            1,
            last_seen,
            key,
            strength,
            WsFlags::COMMIT | WsFlags::ISOLATION,
            &data,
            None,
        );
        if let Some(begin) = res.ends_nbo {
            self.cert.erase_nbo_ctx(begin);
        }
        res
    }
}

fn node1() -> NodeId {
    NodeId::from_byte(1)
}

fn node2() -> NodeId {
    NodeId::from_byte(2)
}

fn ok(res: &Appended, depends: i64) {
    assert_eq!(res.result, TestResult::Ok, "expected OK at {}", res.seqno);
    assert_eq!(res.depends, Seqno(depends), "depends at {}", res.seqno);
}

fn failed(res: &Appended, depends: i64) {
    assert_eq!(
        res.result,
        TestResult::Failed,
        "expected FAILED at {}",
        res.seqno
    );
    assert_eq!(res.depends, Seqno(depends), "depends at {}", res.seqno);
}

/// One row of the strength-pair matrix: first write-set from node 1, second
/// from node 2, same key, both with last_seen 0.
fn pair(first: KeyStrength, second: KeyStrength) -> Appended {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "l"], first);
    assert_eq!(res.result, TestResult::Ok);
    f.trx(node2(), 0, &["b", "l"], second)
}

#[test]
fn certify_against_shared() {
    ok(&pair(KeyStrength::Shared, KeyStrength::Shared), 0);
    ok(&pair(KeyStrength::Shared, KeyStrength::Reference), 0);
    ok(&pair(KeyStrength::Shared, KeyStrength::Update), 1);
    // An exclusive write does not invalidate a plain shared read.
    ok(&pair(KeyStrength::Shared, KeyStrength::Exclusive), 1);
}

#[test]
fn certify_against_reference() {
    ok(&pair(KeyStrength::Reference, KeyStrength::Shared), 0);
    ok(&pair(KeyStrength::Reference, KeyStrength::Reference), 0);
    ok(&pair(KeyStrength::Reference, KeyStrength::Update), 1);
    failed(&pair(KeyStrength::Reference, KeyStrength::Exclusive), 1);
}

#[test]
fn certify_against_update() {
    ok(&pair(KeyStrength::Update, KeyStrength::Shared), 1);
    ok(&pair(KeyStrength::Update, KeyStrength::Reference), 1);
    failed(&pair(KeyStrength::Update, KeyStrength::Update), 1);
    failed(&pair(KeyStrength::Update, KeyStrength::Exclusive), 1);
}

#[test]
fn certify_against_exclusive() {
    failed(&pair(KeyStrength::Exclusive, KeyStrength::Shared), 1);
    failed(&pair(KeyStrength::Exclusive, KeyStrength::Reference), 1);
    failed(&pair(KeyStrength::Exclusive, KeyStrength::Update), 1);
    failed(&pair(KeyStrength::Exclusive, KeyStrength::Exclusive), 1);
}

/// Second write-set has a longer path, so its branch part certifies
/// against the first one's leaf.
fn branch_after_leaf(leaf: KeyStrength) -> Appended {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "b"], leaf);
    assert_eq!(res.result, TestResult::Ok);
    f.trx(node2(), 0, &["b", "b", "l"], KeyStrength::Exclusive)
}

#[test]
fn certify_branch_against_leaf() {
    ok(&branch_after_leaf(KeyStrength::Shared), 0);
    ok(&branch_after_leaf(KeyStrength::Reference), 0);
    ok(&branch_after_leaf(KeyStrength::Update), 1);
    failed(&branch_after_leaf(KeyStrength::Exclusive), 1);
}

/// Second write-set is shorter, so its leaf certifies against the first
/// one's branch part.
fn leaf_after_branch(leaf: KeyStrength) -> Appended {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "b", "l"], KeyStrength::Shared);
    assert_eq!(res.result, TestResult::Ok);
    f.trx(node2(), 0, &["b", "b"], leaf)
}

#[test]
fn certify_leaf_against_branch() {
    ok(&leaf_after_branch(KeyStrength::Shared), 0);
    ok(&leaf_after_branch(KeyStrength::Reference), 0);
    ok(&leaf_after_branch(KeyStrength::Update), 1);
    failed(&leaf_after_branch(KeyStrength::Exclusive), 1);
}

/// Ordinary write-set against a TOI entry of the given strength.
fn after_toi(toi_strength: KeyStrength, trx_strength: KeyStrength) -> Appended {
    let mut f = Fixture::new();
    let res = f.toi(node1(), 0, &["b", "l"], toi_strength);
    assert_eq!(res.result, TestResult::Ok);
    f.trx(node2(), 0, &["b", "l"], trx_strength)
}

#[test]
fn certify_after_toi() {
    use KeyStrength::{Exclusive, Reference, Shared, Update};
    ok(&after_toi(Shared, Shared), 0);
    ok(&after_toi(Shared, Reference), 0);
    ok(&after_toi(Shared, Update), 1);
    ok(&after_toi(Shared, Exclusive), 1);
    ok(&after_toi(Reference, Shared), 0);
    ok(&after_toi(Reference, Reference), 0);
    ok(&after_toi(Reference, Update), 1);
    failed(&after_toi(Reference, Exclusive), 1);
    ok(&after_toi(Update, Shared), 1);
    ok(&after_toi(Update, Reference), 1);
    failed(&after_toi(Update, Update), 1);
    failed(&after_toi(Update, Exclusive), 1);
    failed(&after_toi(Exclusive, Shared), 1);
    failed(&after_toi(Exclusive, Reference), 1);
    failed(&after_toi(Exclusive, Update), 1);
    failed(&after_toi(Exclusive, Exclusive), 1);
}

#[test]
fn toi_never_fails_certification() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    // Exclusive-exclusive would fail for a transaction; a TOI depends.
    let res = f.toi(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 1);
}

#[test]
fn toi_always_depends_on_the_previous_seqno() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["x"], KeyStrength::Shared);
    ok(&res, 0);
    // Disjoint key: a transaction would have no dependency, a TOI still
    // serializes behind everything delivered before it.
    let res = f.toi(node2(), 0, &["y"], KeyStrength::Exclusive);
    ok(&res, 1);
    let res = f.toi(node2(), 0, &["z"], KeyStrength::Exclusive);
    ok(&res, 2);
}

#[test]
fn toi_after_toi_depends() {
    let mut f = Fixture::new();
    let res = f.toi(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    let res = f.toi(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 1);
}

#[test]
fn nbo_begin_blocks_toi_until_end() {
    let mut f = Fixture::new();
    let res = f.nbo_begin(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    assert_eq!(res.seqno, Seqno(1));

    let res = f.toi(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    failed(&res, 1);

    let res = f.nbo_end(node1(), 0, &["b", "l"], KeyStrength::Exclusive, 1);
    assert_eq!(res.result, TestResult::Ok);
    assert_eq!(res.ends_nbo, Some(Seqno(1)));

    let res = f.toi(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 3);
}

#[test]
fn toi_then_nbo_begin_depends() {
    let mut f = Fixture::new();
    let res = f.toi(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    let res = f.nbo_begin(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 1);
    assert_eq!(res.seqno, Seqno(2));

    f.nbo_end(node1(), 0, &["b", "l"], KeyStrength::Exclusive, 2);
    let res = f.toi(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 3);
}

#[test]
fn nbo_begin_blocks_nbo_begin() {
    let mut f = Fixture::new();
    let res = f.nbo_begin(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    let res = f.nbo_begin(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    failed(&res, 1);

    f.nbo_end(node1(), 0, &["b", "l"], KeyStrength::Exclusive, 1);
    let res = f.nbo_begin(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 3);
}

#[test]
fn same_node_never_conflicts() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    // Same source, different connection: dependency, not conflict.
    let res = f.append_raw(
        node1(),
        2,
        0,
        &["b", "l"],
        KeyStrength::Exclusive,
        WsFlags::BEGIN | WsFlags::COMMIT,
        &[],
        None,
    );
    ok(&res, 1);
}

#[test]
fn match_outside_certification_range_is_a_dependency() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    // The second writer had already seen seqno 1.
    let res = f.trx(node2(), 1, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 1);
}

#[test]
fn conflict_stops_the_scan() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
    let res = f.trx(node2(), 1, &["b", "l"], KeyStrength::Shared);
    ok(&res, 1);

    // Conflicts against the exclusive entry at 1; the scan stops there and
    // the dependency stays at the conflicting seqno.
    let res = f.trx(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    failed(&res, 1);
}

#[test]
fn pa_unsafe_forces_serial_apply_with_match() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "l"], KeyStrength::Shared);
    ok(&res, 0);
    let res = f.append_raw(
        node2(),
        1,
        0,
        &["b", "l"],
        KeyStrength::Shared,
        WsFlags::BEGIN | WsFlags::COMMIT | WsFlags::PA_UNSAFE,
        &[],
        None,
    );
    ok(&res, 1);
}

#[test]
fn pa_unsafe_forces_serial_apply_without_match() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "m"], KeyStrength::Shared);
    ok(&res, 0);
    let res = f.append_raw(
        node2(),
        1,
        0,
        &["b", "l"],
        KeyStrength::Shared,
        WsFlags::BEGIN | WsFlags::COMMIT | WsFlags::PA_UNSAFE,
        &[],
        None,
    );
    ok(&res, 1);
}

#[test]
fn disjoint_keys_do_not_interact() {
    let mut f = Fixture::new();
    let res = f.trx(node1(), 0, &["b", "m"], KeyStrength::Exclusive);
    ok(&res, 0);
    let res = f.trx(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    ok(&res, 0);
}

/// Zero-level interactions, with every write-set carrying the implicit
/// reference-strength zero-level key the way the replicator appends it.
#[test]
fn zero_level_rules() {
    let mut f = Fixture::new();
    let node3 = NodeId::from_byte(3);
    let trx_flags = WsFlags::BEGIN | WsFlags::COMMIT;
    let branch = fgalera_types::KeyStrength::BRANCH;

    // 1: reference leaf from node 1, no dependencies.
    let res = f.append_raw(
        node1(), 1, 0, &["1", "1", "1"], KeyStrength::Reference, trx_flags, &[], Some(branch),
    );
    ok(&res, 0);

    // 2: exclusive zero-level from the same source depends on 1.
    let res = f.append_raw(
        node1(), 1, 0, &[], KeyStrength::Shared, trx_flags, &[], Some(KeyStrength::Exclusive),
    );
    ok(&res, 1);

    // 3: default zero-level, last seen 1: conflicts with 2.
    let res = f.append_raw(
        node2(), 1, 1, &["1", "1", "1"], KeyStrength::Reference, trx_flags, &[], Some(branch),
    );
    failed(&res, 2);

    // 4: had seen 2 already: dependency.
    let res = f.append_raw(
        node3, 1, 2, &["1", "1", "1"], KeyStrength::Reference, trx_flags, &[], Some(branch),
    );
    ok(&res, 2);

    // 5: exclusive leaves conflict with 4's reference leaf.
    let res = f.append_raw(
        node1(), 1, 0, &["1", "1", "1"], KeyStrength::Exclusive, trx_flags, &[], Some(branch),
    );
    failed(&res, 4);

    // 6: reference from the source of 2: depends, same source.
    let res = f.append_raw(
        node1(), 1, 1, &["1", "1", "1"], KeyStrength::Reference, trx_flags, &[], Some(branch),
    );
    ok(&res, 2);

    // 7: exclusive leaves, saw 2: conflicts with 6.
    let res = f.append_raw(
        node2(), 1, 2, &["1", "1", "1"], KeyStrength::Exclusive, trx_flags, &[], Some(branch),
    );
    failed(&res, 6);

    // 8: exclusive zero-level depends on 6 (same source).
    let res = f.append_raw(
        node1(), 1, 4, &[], KeyStrength::Shared, trx_flags, &[], Some(KeyStrength::Exclusive),
    );
    ok(&res, 6);

    // 9: exclusive zero-level from another node conflicts with 8.
    let res = f.append_raw(
        node2(), 1, 6, &[], KeyStrength::Shared, trx_flags, &[], Some(KeyStrength::Exclusive),
    );
    failed(&res, 8);
}

#[test]
fn failed_write_sets_leave_no_index_trace() {
    let mut f = Fixture::new();
    f.trx(node1(), 0, &["b", "l"], KeyStrength::Exclusive);
    let before = f.cert.index_size();

    let res = f.trx(node2(), 0, &["b", "l"], KeyStrength::Exclusive);
    assert_eq!(res.result, TestResult::Failed);
    assert_eq!(f.cert.index_size(), before);
}

#[test]
fn purge_trims_the_index() {
    let mut f = Fixture::new();
    f.trx(node1(), 0, &["a"], KeyStrength::Exclusive);
    f.trx(node1(), 1, &["b"], KeyStrength::Exclusive);
    assert!(f.cert.index_size() > 0);

    f.cert.purge_trxs_upto(Seqno(2));
    assert_eq!(f.cert.index_size(), 0);

    // New write-sets certify cleanly against the trimmed index.
    let res = f.trx(node2(), 0, &["a"], KeyStrength::Exclusive);
    ok(&res, 0);
}

#[test]
fn determinism_across_engines() {
    let run = || {
        let mut f = Fixture::new();
        let mut log = Vec::new();
        let keys: [&[&str]; 3] = [&["t", "1"], &["t", "2"], &["u", "1"]];
        let strengths = [
            KeyStrength::Shared,
            KeyStrength::Update,
            KeyStrength::Exclusive,
        ];
        for i in 0..24i64 {
            let node = if i % 3 == 0 { node1() } else { node2() };
            let key = keys[usize::try_from(i % 3).unwrap()];
            let strength = strengths[usize::try_from(i % 3).unwrap()];
            let last_seen = (i - 3).max(0);
            let res = f.trx(node, last_seen, key, strength);
            log.push((res.result, res.depends));
        }
        log
    };
    assert_eq!(run(), run());
}
