use crate::{
    error::{Error, Result},
    flags::TrxFlags,
    key::{KeyAccess, KeyPart},
    provider::BufferId,
    seqno::{SEQNO_UNDEFINED, Seqno, SourceId},
    trx::TrxState,
    writeset::WriteSet,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::{fmt, sync::Arc, time::Duration};

/// Shared handle to one replicated transaction.
///
/// Cloning is cheap; all clones refer to the same record. Immutable
/// identity (originator, key set, payload buffer) lives outside the lock,
/// the mutable record behind it. The handle's mutex is never held across
/// a monitor wait, so a brute-force abort from another thread can always
/// acquire it.
pub struct TrxHandle {
    inner: Arc<TrxInner>,
}

struct TrxInner {
    source_id: SourceId,
    conn_id: u64,
    trx_id: u64,
    local: bool,
    keys: Vec<KeyPart>,
    payload_len: usize,
    mu: Mutex<TrxMut>,
    // Signals seqno assignment and abort to a client blocked in
    // wait_delivered().
    cond: Condvar,
}

/// The mutable transaction record. Access through [`TrxHandle::lock`].
pub struct TrxMut {
    state: TrxState,
    flags: TrxFlags,
    global_seqno: Seqno,
    local_seqno: Seqno,
    last_seen_seqno: Seqno,
    depends_seqno: Seqno,
    certified: bool,
    committed: bool,
    cert_bypass: bool,
    cert_keys: SmallVec<[(u64, KeyAccess); 8]>,
    buffer: Option<BufferId>,
    apply_entered: bool,
    commit_entered: bool,
}

/// Guard over the mutable record.
pub struct TrxGuard<'a> {
    guard: MutexGuard<'a, TrxMut>,
    cond: &'a Condvar,
}

impl TrxHandle {
    /// Creates a handle for a transaction executing on this node, before
    /// replication.
    pub fn new_local(
        source_id: SourceId,
        conn_id: u64,
        trx_id: u64,
        flags: TrxFlags,
        keys: Vec<KeyPart>,
        payload_len: usize,
    ) -> Self {
        Self::new(source_id, conn_id, trx_id, flags, keys, payload_len, true, TrxState::Executing)
    }

    /// Creates a handle for a write set delivered from another node.
    pub fn new_remote(ws: &WriteSet, global_seqno: Seqno, local_seqno: Seqno) -> Self {
        let trx = Self::new(
            ws.source_id,
            ws.conn_id,
            ws.trx_id,
            ws.flags,
            ws.keys.clone(),
            ws.payload.len(),
            false,
            TrxState::Replicating,
        );
        {
            let mut g = trx.lock();
            g.guard.global_seqno = global_seqno;
            g.guard.local_seqno = local_seqno;
            g.guard.last_seen_seqno = ws.last_seen_seqno;
        }
        trx
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        source_id: SourceId,
        conn_id: u64,
        trx_id: u64,
        flags: TrxFlags,
        keys: Vec<KeyPart>,
        payload_len: usize,
        local: bool,
        state: TrxState,
    ) -> Self {
        Self {
            inner: Arc::new(TrxInner {
                source_id,
                conn_id,
                trx_id,
                local,
                keys,
                payload_len,
                mu: Mutex::new(TrxMut {
                    state,
                    flags,
                    global_seqno: SEQNO_UNDEFINED,
                    local_seqno: SEQNO_UNDEFINED,
                    last_seen_seqno: SEQNO_UNDEFINED,
                    depends_seqno: SEQNO_UNDEFINED,
                    certified: false,
                    committed: false,
                    cert_bypass: false,
                    cert_keys: SmallVec::new(),
                    buffer: None,
                    apply_entered: false,
                    commit_entered: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Locks the mutable record.
    pub fn lock(&self) -> TrxGuard<'_> {
        TrxGuard { guard: self.inner.mu.lock(), cond: &self.inner.cond }
    }

    /// Originating node id.
    pub fn source_id(&self) -> SourceId {
        self.inner.source_id
    }

    /// Originating connection id.
    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    /// Originator-local transaction id.
    pub fn trx_id(&self) -> u64 {
        self.inner.trx_id
    }

    /// Whether this transaction originated on this node.
    pub fn is_local(&self) -> bool {
        self.inner.local
    }

    /// The certified key set.
    pub fn keys(&self) -> &[KeyPart] {
        &self.inner.keys
    }

    /// Payload size in bytes, for purge accounting.
    pub fn payload_len(&self) -> usize {
        self.inner.payload_len
    }

    // Locking accessors for the common reads.

    /// Current state.
    pub fn state(&self) -> TrxState {
        self.inner.mu.lock().state
    }

    /// Flag word (may gain `ROLLBACK` when the trx is dummified).
    pub fn flags(&self) -> TrxFlags {
        self.inner.mu.lock().flags
    }

    /// Cluster-wide position, `SEQNO_UNDEFINED` before delivery.
    pub fn global_seqno(&self) -> Seqno {
        self.inner.mu.lock().global_seqno
    }

    /// Node-local delivery position.
    pub fn local_seqno(&self) -> Seqno {
        self.inner.mu.lock().local_seqno
    }

    /// Snapshot horizon of the originator.
    pub fn last_seen_seqno(&self) -> Seqno {
        self.inner.mu.lock().last_seen_seqno
    }

    /// Certification outcome; `SEQNO_UNDEFINED` means "must not apply".
    pub fn depends_seqno(&self) -> Seqno {
        self.inner.mu.lock().depends_seqno
    }

    /// Whether certification admitted this write set.
    pub fn is_certified(&self) -> bool {
        self.inner.mu.lock().certified
    }

    /// Whether the commit has been recorded with the certifier.
    pub fn is_committed(&self) -> bool {
        self.inner.mu.lock().committed
    }

    /// Dummy write sets advance seqnos but never apply.
    pub fn is_dummy(&self) -> bool {
        self.inner.mu.lock().is_dummy()
    }

    /// Total-order-isolation write set.
    pub fn is_toi(&self) -> bool {
        self.inner.mu.lock().flags.is_toi()
    }

    /// Gcache buffer holding the encoded write set.
    pub fn buffer(&self) -> Option<BufferId> {
        self.inner.mu.lock().buffer
    }

    /// Blocks the client thread until the transport has assigned seqnos,
    /// or the transaction is aborted first.
    ///
    /// Delivery wins over abort: a delivered write set must still run
    /// certification (identically on every node) before its fate is
    /// decided, so an abort noticed after delivery is reported by the
    /// later pipeline stages instead.
    pub fn wait_delivered(&self) -> Result<(Seqno, Seqno)> {
        let mut g = self.inner.mu.lock();
        loop {
            if g.global_seqno != SEQNO_UNDEFINED {
                return Ok((g.global_seqno, g.local_seqno));
            }
            if g.state == TrxState::MustAbort {
                return Err(Error::Interrupted);
            }
            self.inner.cond.wait(&mut g);
        }
    }

    /// [`wait_delivered`](TrxHandle::wait_delivered) with a deadline.
    pub fn wait_delivered_for(&self, timeout: Duration) -> Result<(Seqno, Seqno)> {
        let mut g = self.inner.mu.lock();
        loop {
            if g.global_seqno != SEQNO_UNDEFINED {
                return Ok((g.global_seqno, g.local_seqno));
            }
            if g.state == TrxState::MustAbort {
                return Err(Error::Interrupted);
            }
            if self.inner.cond.wait_for(&mut g, timeout).timed_out() {
                return Err(Error::Timeout { seqno: SEQNO_UNDEFINED });
            }
        }
    }
}

impl TrxGuard<'_> {
    /// Current state.
    pub fn state(&self) -> TrxState {
        self.guard.state
    }

    /// Transitions the state machine.
    ///
    /// An illegal edge is a fatal invariant violation and aborts the
    /// process.
    pub fn set_state(&mut self, to: TrxState) {
        let from = self.guard.state;
        assert!(from.can_transition(to), "illegal trx state transition {from} -> {to}");
        tracing::trace!(target: "wsrep", %from, %to, seqno = self.guard.global_seqno, "trx state");
        self.guard.state = to;
        self.cond.notify_all();
    }

    /// Flag word.
    pub fn flags(&self) -> TrxFlags {
        self.guard.flags
    }

    /// Global seqno.
    pub fn global_seqno(&self) -> Seqno {
        self.guard.global_seqno
    }

    /// Local seqno.
    pub fn local_seqno(&self) -> Seqno {
        self.guard.local_seqno
    }

    /// Snapshot horizon.
    pub fn last_seen_seqno(&self) -> Seqno {
        self.guard.last_seen_seqno
    }

    /// Depends seqno.
    pub fn depends_seqno(&self) -> Seqno {
        self.guard.depends_seqno
    }

    /// Records the certification verdict.
    pub fn set_depends_seqno(&mut self, depends: Seqno) {
        debug_assert!(
            depends == SEQNO_UNDEFINED || depends < self.guard.global_seqno,
            "depends seqno {depends} not below global seqno {}",
            self.guard.global_seqno
        );
        self.guard.depends_seqno = depends;
    }

    /// Binds the transport-assigned positions and the snapshot horizon to
    /// a locally originated transaction, waking its client.
    pub fn assign_delivery(&mut self, global_seqno: Seqno, local_seqno: Seqno) {
        debug_assert!(self.guard.global_seqno == SEQNO_UNDEFINED);
        debug_assert!(self.guard.last_seen_seqno < global_seqno);
        self.guard.global_seqno = global_seqno;
        self.guard.local_seqno = local_seqno;
        self.cond.notify_all();
    }

    /// Sets the snapshot horizon at replicate time.
    pub fn set_last_seen_seqno(&mut self, seqno: Seqno) {
        self.guard.last_seen_seqno = seqno;
    }

    /// Whether this write set must not apply.
    pub fn is_dummy(&self) -> bool {
        self.guard.is_dummy()
    }

    /// Turns the write set into a no-op rollback: it keeps its place in
    /// every ordered phase but never reaches the apply callback.
    pub fn mark_dummy(&mut self) {
        self.guard.flags |= TrxFlags::ROLLBACK;
        self.guard.depends_seqno = SEQNO_UNDEFINED;
        self.guard.certified = false;
    }

    /// Records a successful certification.
    pub fn mark_certified(&mut self) {
        self.guard.certified = true;
    }

    /// Whether certification admitted this write set.
    pub fn is_certified(&self) -> bool {
        self.guard.certified
    }

    /// Marks the commit as recorded.
    pub fn mark_committed(&mut self) {
        self.guard.committed = true;
    }

    /// Whether the commit has been recorded.
    pub fn is_committed(&self) -> bool {
        self.guard.committed
    }

    /// Skip certification entirely (state transfer, preordered events).
    pub fn set_cert_bypass(&mut self, bypass: bool) {
        self.guard.cert_bypass = bypass;
    }

    /// Whether certification is bypassed.
    pub fn cert_bypass(&self) -> bool {
        self.guard.cert_bypass
    }

    /// Key-index back references recorded by certification.
    pub fn cert_keys(&self) -> &[(u64, KeyAccess)] {
        &self.guard.cert_keys
    }

    /// Appends an index back reference.
    pub fn push_cert_key(&mut self, fingerprint: u64, access: KeyAccess) {
        self.guard.cert_keys.push((fingerprint, access));
    }

    /// Clears the back references after an index purge.
    pub fn clear_cert_keys(&mut self) {
        self.guard.cert_keys.clear();
    }

    /// Associates the gcache buffer.
    pub fn set_buffer(&mut self, buffer: BufferId) {
        self.guard.buffer = Some(buffer);
    }

    /// Gcache buffer holding the encoded write set.
    pub fn buffer(&self) -> Option<BufferId> {
        self.guard.buffer
    }

    /// Tracks apply-monitor occupancy for the unwind paths.
    pub fn set_apply_entered(&mut self, entered: bool) {
        self.guard.apply_entered = entered;
    }

    /// Whether the trx currently occupies its apply-monitor slot.
    pub fn apply_entered(&self) -> bool {
        self.guard.apply_entered
    }

    /// Tracks commit-monitor occupancy for the unwind paths.
    pub fn set_commit_entered(&mut self, entered: bool) {
        self.guard.commit_entered = entered;
    }

    /// Whether the trx currently occupies its commit-monitor slot.
    pub fn commit_entered(&self) -> bool {
        self.guard.commit_entered
    }
}

impl TrxMut {
    fn is_dummy(&self) -> bool {
        self.flags.contains(TrxFlags::ROLLBACK)
    }
}

impl Clone for TrxHandle {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for TrxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.inner.mu.lock();
        f.debug_struct("TrxHandle")
            .field("source", &self.inner.source_id)
            .field("trx_id", &self.inner.trx_id)
            .field("local", &self.inner.local)
            .field("state", &g.state)
            .field("global_seqno", &g.global_seqno)
            .field("local_seqno", &g.local_seqno)
            .field("depends_seqno", &g.depends_seqno)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    fn local_trx() -> TrxHandle {
        TrxHandle::new_local(
            SourceId::from_bytes([1; 16]),
            1,
            7,
            TrxFlags::BEGIN | TrxFlags::COMMIT,
            vec![KeyPart::new(Key::new([b"k".to_vec()]), KeyAccess::Exclusive)],
            10,
        )
    }

    #[test]
    fn clone_shares_state() {
        let a = local_trx();
        let b = a.clone();
        a.lock().set_state(TrxState::Replicating);
        assert_eq!(b.state(), TrxState::Replicating);
    }

    #[test]
    #[should_panic(expected = "illegal trx state transition")]
    fn illegal_transition_panics() {
        let trx = local_trx();
        trx.lock().set_state(TrxState::Committed);
    }

    #[test]
    fn mark_dummy_clears_certification() {
        let trx = local_trx();
        {
            let mut g = trx.lock();
            g.mark_certified();
            g.mark_dummy();
        }
        assert!(trx.is_dummy());
        assert!(!trx.is_certified());
        assert_eq!(trx.depends_seqno(), SEQNO_UNDEFINED);
    }

    #[test]
    fn delivery_wakes_waiter() {
        let trx = local_trx();
        trx.lock().set_state(TrxState::Replicating);
        let waiter = trx.clone();
        let th = std::thread::spawn(move || waiter.wait_delivered_for(Duration::from_secs(5)));
        {
            let mut g = trx.lock();
            g.set_last_seen_seqno(0);
            g.assign_delivery(3, 1);
        }
        assert_eq!(th.join().unwrap().unwrap(), (3, 1));
    }

    #[test]
    fn abort_wakes_waiter() {
        let trx = local_trx();
        trx.lock().set_state(TrxState::Replicating);
        let waiter = trx.clone();
        let th = std::thread::spawn(move || waiter.wait_delivered_for(Duration::from_secs(5)));
        trx.lock().set_state(TrxState::MustAbort);
        assert!(matches!(th.join().unwrap(), Err(Error::Interrupted)));
    }

    #[test]
    fn remote_from_writeset() {
        let ws = WriteSet {
            flags: TrxFlags::BEGIN | TrxFlags::COMMIT,
            source_id: SourceId::from_bytes([2; 16]),
            conn_id: 1,
            trx_id: 5,
            last_seen_seqno: 4,
            keys: vec![],
            payload: vec![1, 2, 3],
        };
        let trx = TrxHandle::new_remote(&ws, 9, 2);
        assert!(!trx.is_local());
        assert_eq!(trx.state(), TrxState::Replicating);
        assert_eq!(trx.global_seqno(), 9);
        assert_eq!(trx.local_seqno(), 2);
        assert_eq!(trx.last_seen_seqno(), 4);
        assert_eq!(trx.payload_len(), 3);
    }
}
