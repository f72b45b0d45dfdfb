//! The certification engine: deterministic conflict detection over the
//! totally-ordered write-set stream.

mod index;
pub use index::TestResult;
use index::KeyIndex;

mod nbo;
use nbo::NboMap;

use crate::{
    config::Config,
    error::{Error, Result},
    flags::TrxFlags,
    provider::View,
    seqno::{Gtid, SEQNO_UNDEFINED, Seqno, SourceId},
    trx::{TrxHandle, TrxState},
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

// Purge triggers: when any of these run over, set_trx_committed asks the
// caller to purge.
const KEYS_THRESHOLD: usize = 1 << 10;
const BYTES_THRESHOLD: usize = 128 << 20;
const TRXS_THRESHOLD: usize = 127;

// Rate limit for the oversized-map warning.
const TRX_MAP_WARN_SIZE: usize = 10_000;

struct CertState {
    index: KeyIndex,
    nbo: NboMap,
    trx_map: BTreeMap<Seqno, TrxHandle>,
    // Multiset of depends seqnos of certified, not yet committed trx.
    deps_set: BTreeMap<Seqno, usize>,
    deps_len: usize,
    position: Seqno,
    safe_to_discard: Seqno,
    // Effective purge floor; monotone even though safe_to_discard is not.
    last_purged: Seqno,
    // Everything at or below this seqno must be applied serially.
    last_pa_unsafe: Seqno,
    view_id: SourceId,
    key_count: usize,
    byte_count: usize,
    trx_count: usize,
    trx_size_warn_count: u64,
    log_conflicts: bool,
    optimistic_pa: bool,
    pa_range: Seqno,
}

#[derive(Default)]
struct CertStats {
    n_certified: u64,
    deps_dist: i64,
    cert_interval: i64,
    index_size: usize,
}

/// Consumes write sets in global-seqno order, runs the conflict test and
/// assigns each admitted write set the seqno it depends on.
///
/// All decisions are a pure function of the ordered input stream and the
/// initial position, so every node reaches identical verdicts.
pub struct Certifier {
    mu: Mutex<CertState>,
    stats: Mutex<CertStats>,
    inconsistent: Arc<AtomicBool>,
}

impl Certifier {
    /// Creates a certifier with an undefined position; call
    /// [`assign_initial_position`](Certifier::assign_initial_position)
    /// before feeding it write sets.
    pub fn new(config: &Config) -> Self {
        Self::with_inconsistency_flag(config, Arc::new(AtomicBool::new(false)))
    }

    /// Creates a certifier sharing an externally owned inconsistency
    /// latch.
    pub fn with_inconsistency_flag(config: &Config, inconsistent: Arc<AtomicBool>) -> Self {
        Self {
            mu: Mutex::new(CertState {
                index: KeyIndex::default(),
                nbo: NboMap::default(),
                trx_map: BTreeMap::new(),
                deps_set: BTreeMap::new(),
                deps_len: 0,
                position: SEQNO_UNDEFINED,
                safe_to_discard: SEQNO_UNDEFINED,
                last_purged: SEQNO_UNDEFINED,
                last_pa_unsafe: SEQNO_UNDEFINED,
                view_id: SourceId::UNDEFINED,
                key_count: 0,
                byte_count: 0,
                trx_count: 0,
                trx_size_warn_count: 0,
                log_conflicts: config.log_conflicts,
                optimistic_pa: config.optimistic_pa,
                pa_range: config.pa_range,
            }),
            stats: Mutex::new(CertStats::default()),
            inconsistent,
        }
    }

    /// Current position: the highest global seqno consumed.
    pub fn position(&self) -> Seqno {
        self.mu.lock().position
    }

    /// Advances the position past a gap event that carries no write set.
    pub fn increment_position(&self) -> Seqno {
        let mut st = self.mu.lock();
        st.position += 1;
        st.position
    }

    /// Lowest seqno still held in the trx map, or the position if empty.
    pub fn lowest_trx_seqno(&self) -> Seqno {
        let st = self.mu.lock();
        st.trx_map.keys().next().copied().unwrap_or(st.position)
    }

    /// Looks up a held transaction by global seqno.
    pub fn get_trx(&self, seqno: Seqno) -> Option<TrxHandle> {
        self.mu.lock().trx_map.get(&seqno).cloned()
    }

    /// Number of in-flight non-blocking operations.
    pub fn nbo_size(&self) -> usize {
        self.mu.lock().nbo.len()
    }

    /// Sets the starting position after joining a group or completing
    /// state transfer.
    pub fn assign_initial_position(&self, gtid: Gtid) {
        let mut st = self.mu.lock();
        tracing::info!(target: "wsrep", position = gtid.seqno, group = %gtid.source, "certifier position assigned");
        st.position = gtid.seqno;
        st.safe_to_discard = gtid.seqno;
        st.last_purged = gtid.seqno;
        st.last_pa_unsafe = gtid.seqno;
        st.view_id = gtid.source;
    }

    /// Repositions on a configuration change. A different group id means
    /// a new primary component: the index, NBO state and trx map are
    /// rebuilt from scratch.
    pub fn adjust_position(&self, view: &View, gtid: Gtid) {
        let mut st = self.mu.lock();
        if st.view_id != gtid.source {
            tracing::info!(
                target: "wsrep",
                old = %st.view_id,
                new = %gtid.source,
                members = view.members.len(),
                "primary component changed, resetting certification index"
            );
            st.index.clear();
            st.nbo.clear();
            st.trx_map.clear();
            st.deps_set.clear();
            st.deps_len = 0;
            st.safe_to_discard = gtid.seqno;
            st.last_purged = gtid.seqno;
        } else if st.position != gtid.seqno {
            tracing::debug!(
                target: "wsrep",
                position = st.position,
                new = gtid.seqno,
                "position adjusted on view change"
            );
        }
        st.position = gtid.seqno;
        st.last_pa_unsafe = st.last_pa_unsafe.max(gtid.seqno);
        st.view_id = gtid.source;
    }

    /// Marks the node inconsistent; every later write set is dummified
    /// and the embedder is expected to close down.
    pub fn mark_inconsistent(&self) {
        self.inconsistent.store(true, Ordering::SeqCst);
    }

    /// Whether the node has been marked inconsistent.
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::SeqCst)
    }

    /// Runtime parameter update for `cert.log_conflicts`.
    pub fn set_log_conflicts(&self, on: bool) {
        self.mu.lock().log_conflicts = on;
    }

    /// Runtime parameter update for `cert.optimistic_pa`.
    pub fn set_optimistic_pa(&self, on: bool) {
        self.mu.lock().optimistic_pa = on;
    }

    /// Certifies the next write set in total order.
    ///
    /// The trx must carry `position + 1`: the index is only deterministic
    /// if every node consumes the identical gapless stream, so a dropped
    /// or duplicated delivery fails with [`Error::SeqnoGap`] instead of
    /// being absorbed. A failed conflict test dummifies the trx but still
    /// records it, so seqno bookkeeping stays gapless.
    pub fn append_trx(&self, trx: &TrxHandle) -> Result<TestResult> {
        let mut st = self.mu.lock();
        let mut g = trx.lock();
        let gs = g.global_seqno();
        debug_assert!(gs >= 0 && g.local_seqno() >= 0);

        if st.position != SEQNO_UNDEFINED && gs != st.position + 1 {
            tracing::warn!(target: "wsrep", position = st.position, seqno = gs, "seqno gap in certification stream");
            return Err(Error::SeqnoGap { expected: st.position + 1, got: gs });
        }
        st.position = gs;

        if g.state() == TrxState::Replicating {
            g.set_state(TrxState::Certifying);
        }

        let result = if self.is_inconsistent() {
            g.mark_dummy();
            TestResult::Failed
        } else {
            self.do_test(&mut st, trx, &mut g)
        };

        if result == TestResult::Failed {
            g.mark_dummy();
        }

        // Purge accounting; even failed write sets occupied the stream.
        st.key_count += trx.keys().len();
        st.byte_count += trx.payload_len();
        st.trx_count += 1;

        if g.is_certified() {
            let ds = g.depends_seqno();
            debug_assert!(ds >= 0 && ds < gs);
            *st.deps_set.entry(ds).or_insert(0) += 1;
            st.deps_len += 1;

            let mut stats = self.stats.lock();
            stats.n_certified += 1;
            stats.cert_interval += gs - g.last_seen_seqno() - 1;
            stats.deps_dist += gs - ds;
            stats.index_size = st.index.len();
        }

        st.trx_map.insert(gs, trx.clone());
        if st.trx_map.len() > TRX_MAP_WARN_SIZE {
            st.trx_size_warn_count += 1;
            if st.trx_size_warn_count.is_multiple_of(1000) {
                tracing::warn!(target: "wsrep", size = st.trx_map.len(), "certification trx map is growing, purging may be stuck");
            }
        }

        Ok(result)
    }

    fn do_test(
        &self,
        st: &mut CertState,
        trx: &TrxHandle,
        g: &mut crate::trx::TrxGuard<'_>,
    ) -> TestResult {
        let gs = g.global_seqno();
        let flags = g.flags();

        // Explicit client rollback: ordered no-op.
        if flags.contains(TrxFlags::ROLLBACK) {
            return TestResult::Failed;
        }

        // Preordered or bypassed write sets skip the key test but still
        // serialize behind everything earlier.
        if g.cert_bypass() || flags.contains(TrxFlags::PREORDERED) {
            g.set_depends_seqno(gs - 1);
            g.mark_certified();
            return TestResult::Ok;
        }

        // An in-flight total-order operation holds its keys against
        // everything except its own end event.
        if flags.is_nbo_end() {
            return match st.nbo.end(trx) {
                Some(_start) => {
                    g.set_depends_seqno(gs - 1);
                    g.mark_certified();
                    TestResult::Ok
                }
                None => {
                    tracing::warn!(target: "wsrep", seqno = gs, "unmatched nbo end event");
                    TestResult::Failed
                }
            };
        }
        if let Some(holder) = st.nbo.conflicts(trx) {
            if st.log_conflicts {
                tracing::info!(target: "wsrep", seqno = gs, nbo_start = holder, "write set conflicts with non-blocking operation");
            }
            return TestResult::Failed;
        }

        if flags.is_toi() {
            // Total order: no concurrency, every key referenced
            // exclusively for the span of the operation.
            g.set_depends_seqno(gs - 1);
            st.index.ref_all_exclusive(trx, g);
            g.mark_certified();
            if flags.is_nbo_start() {
                st.nbo.begin(gs, trx);
            }
            if flags.contains(TrxFlags::PA_UNSAFE) {
                st.last_pa_unsafe = gs;
            }
            return TestResult::Ok;
        }

        let floor = st.last_pa_unsafe.max(0);
        match st.index.test_and_ref(trx, g, floor, st.log_conflicts) {
            TestResult::Failed => TestResult::Failed,
            TestResult::Ok => {
                let mut ds = g.depends_seqno();

                // Conservative parallel apply bounds the window by the
                // certification interval; implicit dependencies always do.
                if !st.optimistic_pa || flags.contains(TrxFlags::IMPLICIT_DEPS) {
                    ds = ds.max(g.last_seen_seqno());
                }

                if flags.contains(TrxFlags::PA_UNSAFE) {
                    ds = gs - 1;
                    st.last_pa_unsafe = gs;
                }

                // The apply window must stay inside the monitor ring.
                if st.pa_range > 0 {
                    ds = ds.max(gs - st.pa_range);
                }

                g.set_depends_seqno(ds.min(gs - 1));
                g.mark_certified();
                TestResult::Ok
            }
        }
    }

    /// Records a commit, releasing the trx's dependency hold. Returns a
    /// purge seqno when enough traffic has accumulated since the last
    /// purge.
    pub fn set_trx_committed(&self, trx: &TrxHandle) -> Option<Seqno> {
        let mut st = self.mu.lock();
        let mut g = trx.lock();
        if g.is_committed() {
            return None;
        }

        if g.is_certified() {
            let ds = g.depends_seqno();
            match st.deps_set.get_mut(&ds) {
                Some(n) => {
                    *n -= 1;
                    if *n == 0 {
                        st.deps_set.remove(&ds);
                    }
                    st.deps_len -= 1;
                }
                None => debug_assert!(false, "depends seqno {ds} missing from deps set"),
            }
        }
        g.mark_committed();
        drop(g);

        st.safe_to_discard = Self::safe_to_discard_locked(&st);

        if Self::purge_required(&mut st) { Some(st.safe_to_discard) } else { None }
    }

    /// Safe-to-discard horizon: nothing at or below it can still be
    /// needed by certification or an uncommitted transaction.
    ///
    /// Commits are not recorded in total order, so consecutive reads may
    /// observe this going backwards; the purge floor is what stays
    /// monotone.
    pub fn safe_to_discard_seqno(&self) -> Seqno {
        Self::safe_to_discard_locked(&self.mu.lock())
    }

    fn safe_to_discard_locked(st: &CertState) -> Seqno {
        let mut horizon = st.position;
        if let Some((&min_ds, _)) = st.deps_set.iter().next() {
            horizon = horizon.min(min_ds);
        }
        for (&seqno, trx) in &st.trx_map {
            if !trx.is_committed() {
                horizon = horizon.min(seqno - 1);
                break;
            }
        }
        horizon
    }

    fn purge_required(st: &mut CertState) -> bool {
        if st.key_count > KEYS_THRESHOLD
            || st.byte_count > BYTES_THRESHOLD
            || st.trx_count > TRXS_THRESHOLD
        {
            st.key_count = 0;
            st.byte_count = 0;
            st.trx_count = 0;
            true
        } else {
            false
        }
    }

    /// Discards every trx at or below `min(seqno, safe_to_discard)`,
    /// clearing their index references. Returns the effective purge
    /// floor; write-set buffers up to it may be released. Idempotent.
    pub fn purge_trxs_upto(&self, seqno: Seqno) -> Seqno {
        let mut st = self.mu.lock();
        let stds = Self::safe_to_discard_locked(&st);
        let effective = seqno.min(stds);
        if effective <= st.last_purged {
            return st.last_purged;
        }

        let keep = st.trx_map.split_off(&(effective + 1));
        let purged = std::mem::replace(&mut st.trx_map, keep);
        let inconsistent = self.is_inconsistent();

        let CertState { index, deps_set, deps_len, .. } = &mut *st;
        for (seqno, trx) in purged {
            let mut g = trx.lock();
            if !inconsistent && !g.is_committed() {
                tracing::warn!(target: "wsrep", seqno, "purging uncommitted trx");
            }
            // Certified write sets put keys in the index; TOI ones always
            // did, even when a later NBO test dummified them.
            if g.depends_seqno() >= 0 || g.flags().is_toi() {
                index.purge(&mut g);
            }
            // Uncommitted trx purged on the inconsistent path still hold
            // a deps entry.
            if g.is_certified() && !g.is_committed() {
                let ds = g.depends_seqno();
                if let Some(n) = deps_set.get_mut(&ds) {
                    *n -= 1;
                    if *n == 0 {
                        deps_set.remove(&ds);
                    }
                    *deps_len -= 1;
                }
            }
        }
        st.last_purged = effective;
        self.stats.lock().index_size = st.index.len();
        tracing::debug!(target: "wsrep", upto = effective, index = st.index.len(), "certification purge");
        effective
    }

    /// Statistics snapshot: `(avg certification interval, avg deps
    /// distance, index size)`.
    pub fn stats(&self) -> (f64, f64, usize) {
        let stats = self.stats.lock();
        if stats.n_certified > 0 {
            let n = stats.n_certified as f64;
            (stats.cert_interval as f64 / n, stats.deps_dist as f64 / n, stats.index_size)
        } else {
            (0.0, 0.0, stats.index_size)
        }
    }

    /// Zeroes the statistics counters.
    pub fn stats_reset(&self) {
        *self.stats.lock() = CertStats::default();
    }

    #[cfg(test)]
    pub(crate) fn deps_len(&self) -> usize {
        self.mu.lock().deps_len
    }

    #[cfg(test)]
    pub(crate) fn index_len(&self) -> usize {
        self.mu.lock().index.len()
    }

    #[cfg(test)]
    pub(crate) fn trx_map_len(&self) -> usize {
        self.mu.lock().trx_map.len()
    }
}
