use crate::{
    cert::{Certifier, TestResult},
    config::{Config, params},
    error::{Error, Result},
    flags::TrxFlags,
    key::KeyPart,
    monitor::{ApplyOrder, CommitOrder, CommitPolicy, LocalOrder, Mode, Monitor},
    provider::{EventHandler, Transport, View, WriteSetStore},
    seqno::{Gtid, SEQNO_UNDEFINED, Seqno, SourceId},
    service::{ServiceHandle, ServiceThd},
    stats::{MonitorStats, Stats},
    trx::{TrxGuard, TrxHandle, TrxState},
    writeset::WriteSet,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Instant,
};

/// The ordered replication pipeline.
///
/// Binds the certifier and the three monitors: every delivered write set
/// runs local-order → certification → apply-order → commit-order, with
/// parallelism between appliers bounded by certified dependencies.
///
/// Remote write sets are driven end-to-end by
/// [`process_writeset`](Replicator::process_writeset) on the calling
/// applier thread. Local transactions split the same path across the
/// client-facing calls: [`replicate`](Replicator::replicate) →
/// [`certify`](Replicator::certify) → the client's own apply →
/// [`commit_order_enter`](Replicator::commit_order_enter) /
/// [`commit_order_leave`](Replicator::commit_order_leave).
pub struct Replicator<T, G, H> {
    source_id: SourceId,
    config: Config,
    transport: Arc<T>,
    store: Arc<G>,
    handler: Arc<H>,
    certifier: Certifier,
    local_monitor: Monitor<LocalOrder>,
    apply_monitor: Monitor<ApplyOrder>,
    commit_monitor: Monitor<CommitOrder>,
    service: ServiceHandle,
    inconsistent: Arc<AtomicBool>,
    closed: AtomicBool,
    paused: Mutex<bool>,
    last_local_seqno: AtomicI64,
    // Local transactions between replicate() and delivery, by trx id.
    pending: Mutex<HashMap<u64, TrxHandle>>,
}

impl<T, G, H> Replicator<T, G, H>
where
    T: Transport + 'static,
    G: WriteSetStore + 'static,
    H: EventHandler,
{
    /// Creates a replicator. Call [`connect`](Replicator::connect) with
    /// the group position before feeding it events.
    pub fn new(
        config: Config,
        source_id: SourceId,
        transport: Arc<T>,
        store: Arc<G>,
        handler: Arc<H>,
    ) -> Self {
        let inconsistent = Arc::new(AtomicBool::new(false));
        let service =
            ServiceThd::spawn(Arc::clone(&transport), Arc::clone(&store), Arc::clone(&inconsistent));
        let certifier = Certifier::with_inconsistency_flag(&config, Arc::clone(&inconsistent));

        let commit_monitor = Monitor::new(config.monitor_window);
        if config.commit_order == CommitPolicy::Bypass {
            commit_monitor.assign_mode(Mode::Bypass);
        }

        Self {
            source_id,
            transport,
            store,
            handler,
            certifier,
            local_monitor: Monitor::new(config.monitor_window),
            apply_monitor: Monitor::new(config.apply_window),
            commit_monitor,
            service,
            inconsistent,
            closed: AtomicBool::new(false),
            paused: Mutex::new(false),
            last_local_seqno: AtomicI64::new(SEQNO_UNDEFINED),
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Installs the starting position after joining a group (or after
    /// state transfer).
    pub fn connect(&self, gtid: Gtid) {
        tracing::info!(target: "wsrep", %gtid, "connected");
        self.certifier.assign_initial_position(gtid);
        self.local_monitor.assign_initial_position(self.last_local_seqno.load(Ordering::SeqCst).max(0));
        self.apply_monitor.assign_initial_position(gtid.seqno);
        self.commit_monitor.assign_initial_position(gtid.seqno);
        self.service.flush(gtid.source);
    }

    /// Stops accepting work and aborts clients waiting for delivery.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(target: "wsrep", "closing replicator");
        let pending: Vec<TrxHandle> = self.pending.lock().drain().map(|(_, t)| t).collect();
        for trx in pending {
            let mut g = trx.lock();
            if g.state() == TrxState::Replicating {
                g.set_state(TrxState::MustAbort);
            }
        }
        self.service.reset();
    }

    /// Whether [`close`](Replicator::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// This node's id.
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// The certification engine (read-mostly introspection).
    pub fn certifier(&self) -> &Certifier {
        &self.certifier
    }

    /// Largest seqno whose apply has fully finished.
    pub fn last_committed(&self) -> Seqno {
        self.apply_monitor.last_left()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.inconsistent.load(Ordering::SeqCst) {
            return Err(Error::Inconsistent);
        }
        Ok(())
    }

    // ----- applier thread entry points ---------------------------------

    /// Processes one delivered write set. Called from an applier thread,
    /// one per in-flight write set; parallelism between appliers is
    /// bounded by the apply monitor.
    pub fn process_writeset(&self, global_seqno: Seqno, local_seqno: Seqno, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let span = tracing::debug_span!(target: "wsrep", "writeset", seqno = global_seqno);
        let _guard = span.entered();

        self.last_local_seqno.store(local_seqno, Ordering::SeqCst);
        let ws = WriteSet::decode(data)?;
        let buffer = self.store.alloc(data)?;

        if ws.source_id == self.source_id {
            let pending = self.pending.lock().get(&ws.trx_id).cloned();
            if let Some(trx) = pending {
                let mut g = trx.lock();
                if g.state() == TrxState::Replicating {
                    // Healthy waiting client: hand delivery over and let
                    // it drive the rest of the pipeline.
                    g.set_buffer(buffer);
                    g.assign_delivery(global_seqno, local_seqno);
                    drop(g);
                    self.pending.lock().remove(&ws.trx_id);
                    return Ok(());
                }
                // The client gave up before delivery. The write set is
                // ordered cluster-wide regardless, so it runs the remote
                // path; every node reaches the same verdict.
                drop(g);
                self.pending.lock().remove(&ws.trx_id);
            }
        }

        let trx = TrxHandle::new_remote(&ws, global_seqno, local_seqno);
        trx.lock().set_buffer(buffer);
        self.process_remote(&trx, &ws.payload)
    }

    /// Processes a configuration change: drains the pipeline, repositions
    /// certification, and reports the new membership to the DBMS.
    pub fn process_view(&self, view: &View) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        tracing::info!(target: "wsrep", id = %view.id, members = view.members.len(), "view change");

        let position = self.certifier.position();
        let local = self.last_local_seqno.load(Ordering::SeqCst);
        if local != SEQNO_UNDEFINED {
            self.local_monitor.drain(local);
        }
        if position != SEQNO_UNDEFINED {
            self.apply_monitor.drain(position);
            self.commit_monitor.drain(position);
        }

        self.certifier.adjust_position(view, view.id);
        self.apply_monitor.assign_initial_position(view.id.seqno);
        self.commit_monitor.assign_initial_position(view.id.seqno);

        self.handler.view_change(view);
        self.service.flush(view.id.source);
        Ok(())
    }

    /// Processes a commit-cut event: the group agreed that everything at
    /// or below `seqno` is committed cluster-wide.
    pub fn process_commit_cut(&self, seqno: Seqno) -> Result<()> {
        self.ensure_open()?;
        let effective = self.certifier.purge_trxs_upto(seqno);
        if effective >= 0 {
            self.service.release_seqno(effective);
        }
        Ok(())
    }

    fn process_remote(&self, trx: &TrxHandle, payload: &[u8]) -> Result<()> {
        let lo = LocalOrder::new(trx);
        self.local_monitor.enter(&lo)?;
        let verdict = self.certifier.append_trx(trx);
        self.local_monitor.leave(&lo);
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(err) => return self.fail_on_gap(trx, err),
        };

        self.assign_buffer_order(trx);

        if verdict == TestResult::Failed || trx.is_dummy() {
            self.cancel_order(trx);
            {
                let mut g = trx.lock();
                Self::unwind_to_rolled_back(&mut g);
            }
            self.finish(trx);
            // A failed remote certification is not an applier error.
            return Ok(());
        }

        let ao = ApplyOrder::new(trx);
        if self.apply_monitor.enter(&ao).is_err() {
            // Only shutdown interrupts a remote applier.
            self.cancel_order(trx);
            let mut g = trx.lock();
            Self::unwind_to_rolled_back(&mut g);
            return Err(Error::Closed);
        }
        {
            let mut g = trx.lock();
            g.set_state(TrxState::Applying);
            g.set_apply_entered(true);
        }

        if let Err(err) = self.handler.apply(trx, payload) {
            return self.fail_fatally(trx, &ao, true, "apply callback failed", err);
        }

        let co = CommitOrder::new(trx, self.config.commit_order);
        if self.commit_monitor.enter(&co).is_err() {
            // The canceled entry reset the slot to idle without closing
            // the frontier at this seqno; fill it before unwinding.
            self.commit_monitor.self_cancel(&co);
            self.apply_monitor.leave(&ao);
            let mut g = trx.lock();
            Self::unwind_to_rolled_back(&mut g);
            return Err(Error::Closed);
        }
        {
            let mut g = trx.lock();
            g.set_state(TrxState::Committing);
            g.set_commit_entered(true);
        }

        if let Err(err) = self.handler.commit(trx) {
            self.commit_monitor.leave(&co);
            return self.fail_fatally(trx, &ao, false, "commit callback failed", err);
        }

        {
            let mut g = trx.lock();
            g.set_state(TrxState::Committed);
            g.set_commit_entered(false);
            g.set_apply_entered(false);
        }
        self.commit_monitor.leave(&co);
        self.apply_monitor.leave(&ao);
        self.finish(trx);
        Ok(())
    }

    // ----- local client entry points -----------------------------------

    /// Submits a local transaction's write set for total-order
    /// replication and waits for it to be assigned its place in the
    /// global sequence.
    pub fn replicate(
        &self,
        conn_id: u64,
        trx_id: u64,
        flags: TrxFlags,
        keys: Vec<KeyPart>,
        payload: Vec<u8>,
    ) -> Result<TrxHandle> {
        self.ensure_open()?;

        let last_seen = self.last_committed();
        let ws = WriteSet {
            flags,
            source_id: self.source_id,
            conn_id,
            trx_id,
            last_seen_seqno: last_seen,
            keys: keys.clone(),
            payload,
        };
        let data = ws.encode();
        if data.len() > self.config.max_ws_size {
            return Err(Error::WriteSetTooLarge { size: data.len(), max: self.config.max_ws_size });
        }

        let trx =
            TrxHandle::new_local(self.source_id, conn_id, trx_id, flags, keys, ws.payload.len());
        {
            let mut g = trx.lock();
            g.set_last_seen_seqno(last_seen);
            g.set_state(TrxState::Replicating);
        }
        self.pending.lock().insert(trx_id, trx.clone());

        if let Err(err) = self.transport.send(&data) {
            self.pending.lock().remove(&trx_id);
            let mut g = trx.lock();
            g.set_state(TrxState::MustAbort);
            Self::unwind_to_rolled_back(&mut g);
            return Err(err);
        }

        trx.wait_delivered()?;
        Ok(trx)
    }

    /// Runs local ordering and certification for a delivered local
    /// transaction.
    ///
    /// On success the transaction also occupies its apply-monitor slot
    /// (waiting for its dependencies), so a conflicting write set can
    /// brute-force abort it up to the commit point. Returns
    /// [`Error::CertificationFailed`] after unwinding if the test failed,
    /// or [`Error::Interrupted`] if the trx was aborted while waiting —
    /// in the latter case the trx is certified and the caller must either
    /// [`replay`](Replicator::replay) it or roll back through
    /// [`release_rollback`](Replicator::release_rollback).
    pub fn certify(&self, trx: &TrxHandle) -> Result<()> {
        debug_assert!(trx.is_local());
        let (gs, _ls) = trx.wait_delivered()?;
        let span = tracing::debug_span!(target: "wsrep", "certify", seqno = gs);
        let _guard = span.entered();

        let lo = LocalOrder::new(trx);
        // Certification is never interrupted: the write set is already
        // ordered cluster-wide, so the index must be updated identically
        // on every node. An abort flagged meanwhile is honored right
        // after.
        self.local_monitor.enter(&lo)?;
        let verdict = self.certifier.append_trx(trx);
        self.local_monitor.leave(&lo);
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(err) => return self.fail_on_gap(trx, err),
        };

        self.assign_buffer_order(trx);

        if verdict == TestResult::Failed || trx.is_dummy() {
            self.cancel_order(trx);
            {
                let mut g = trx.lock();
                Self::unwind_to_rolled_back(&mut g);
            }
            self.finish(trx);
            return Err(Error::CertificationFailed { seqno: gs });
        }

        let ao = ApplyOrder::new(trx);
        match self.apply_monitor.enter(&ao) {
            Ok(()) => {
                let mut g = trx.lock();
                if g.state() == TrxState::MustAbort {
                    // Aborted between certification and the slot grant;
                    // keep the slot, the caller decides replay/rollback.
                    g.set_apply_entered(true);
                    return Err(Error::Interrupted);
                }
                g.set_state(TrxState::Applying);
                g.set_apply_entered(true);
                Ok(())
            }
            Err(_) => Err(Error::Interrupted),
        }
    }

    /// Enters the commit monitor for a locally applied transaction.
    pub fn commit_order_enter(&self, trx: &TrxHandle) -> Result<()> {
        let co = CommitOrder::new(trx, self.config.commit_order);
        self.commit_monitor.enter(&co)?;
        let mut g = trx.lock();
        if g.state() == TrxState::MustAbort {
            g.set_commit_entered(true);
            return Err(Error::Interrupted);
        }
        g.set_state(TrxState::Committing);
        g.set_commit_entered(true);
        Ok(())
    }

    /// Leaves the commit monitor after the DBMS commit, releasing the
    /// transaction's place in every ordered phase.
    pub fn commit_order_leave(&self, trx: &TrxHandle) -> Result<()> {
        {
            let mut g = trx.lock();
            g.set_state(TrxState::Committed);
            g.set_commit_entered(false);
            g.set_apply_entered(false);
        }
        let co = CommitOrder::new(trx, self.config.commit_order);
        let ao = ApplyOrder::new(trx);
        self.commit_monitor.leave(&co);
        self.apply_monitor.leave(&ao);
        self.finish(trx);
        Ok(())
    }

    /// Replays a certified transaction that was brute-force aborted
    /// before commit: re-applies its write set the way a remote applier
    /// would, then commits in order.
    pub fn replay(&self, trx: &TrxHandle) -> Result<()> {
        let gs = trx.global_seqno();
        tracing::debug!(target: "wsrep", seqno = gs, "replaying");
        let (held_apply, held_commit);
        {
            let mut g = trx.lock();
            debug_assert!(g.is_certified(), "replay of an uncertified trx");
            g.set_state(TrxState::MustReplay);
            g.set_state(TrxState::Replaying);
            held_apply = g.apply_entered();
            held_commit = g.commit_entered();
        }

        let ao = ApplyOrder::new(trx);
        if !held_apply {
            // The abort may have left a stale cancellation on the slot;
            // the first enter consumes it. No further interrupts can land
            // once the trx is in a replay state.
            Self::enter_consuming_cancel(&self.apply_monitor, &ao)?;
        }
        {
            let mut g = trx.lock();
            g.set_state(TrxState::Applying);
            g.set_apply_entered(true);
        }

        let buffer = trx.buffer().ok_or(Error::Corrupt("replayed trx has no buffer"))?;
        let data = self.store.get(buffer)?;
        let ws = WriteSet::decode(&data)?;
        if let Err(err) = self.handler.apply(trx, &ws.payload) {
            return self.fail_fatally(trx, &ao, !held_commit, "replay apply failed", err);
        }

        let co = CommitOrder::new(trx, self.config.commit_order);
        if !held_commit {
            Self::enter_consuming_cancel(&self.commit_monitor, &co)?;
        }
        {
            let mut g = trx.lock();
            g.set_state(TrxState::Committing);
            g.set_commit_entered(true);
        }
        if let Err(err) = self.handler.commit(trx) {
            self.commit_monitor.leave(&co);
            return self.fail_fatally(trx, &ao, false, "replay commit failed", err);
        }
        {
            let mut g = trx.lock();
            g.set_state(TrxState::Committed);
            g.set_commit_entered(false);
            g.set_apply_entered(false);
        }
        self.commit_monitor.leave(&co);
        self.apply_monitor.leave(&ao);
        self.finish(trx);
        Ok(())
    }

    /// Rolls back a local transaction, releasing any ordered-phase slots
    /// it holds. Safe to call at any pre-commit point.
    pub fn release_rollback(&self, trx: &TrxHandle) {
        self.pending.lock().remove(&trx.trx_id());

        let (gs, apply_entered, commit_entered) = {
            let mut g = trx.lock();
            if g.state() == TrxState::RolledBack {
                return;
            }
            let snapshot = (g.global_seqno(), g.apply_entered(), g.commit_entered());
            g.set_apply_entered(false);
            g.set_commit_entered(false);
            Self::unwind_to_rolled_back(&mut g);
            snapshot
        };

        if gs >= 0 {
            let ao = ApplyOrder::new(trx);
            let co = CommitOrder::new(trx, self.config.commit_order);
            if commit_entered {
                self.commit_monitor.leave(&co);
            } else {
                self.commit_monitor.self_cancel(&co);
            }
            if apply_entered {
                self.apply_monitor.leave(&ao);
            } else {
                self.apply_monitor.self_cancel(&ao);
            }
            self.finish(trx);
        }
    }

    /// Brute-force abort: a higher-priority write set at `bf_seqno`
    /// cancels a local transaction still in a pre-commit state. Returns
    /// whether the victim was aborted.
    pub fn abort_trx(&self, victim: &TrxHandle, bf_seqno: Seqno) -> Result<bool> {
        if !victim.is_local() {
            tracing::warn!(target: "wsrep", seqno = victim.global_seqno(), "refusing to abort a remote trx");
            return Ok(false);
        }

        let mut g = victim.lock();
        let state = g.state();
        tracing::debug!(
            target: "wsrep",
            victim = victim.trx_id(),
            seqno = g.global_seqno(),
            bf_seqno,
            %state,
            "brute-force abort"
        );
        match state {
            TrxState::Executing | TrxState::Replicating => {
                g.set_state(TrxState::MustAbort);
                Ok(true)
            }
            TrxState::Certifying => {
                // Certification itself is not interruptible (it must run
                // identically on every node); the victim observes the
                // abort right after.
                g.set_state(TrxState::MustAbort);
                Ok(true)
            }
            TrxState::Applying => {
                g.set_state(TrxState::MustAbort);
                let ao = ApplyOrder::new(victim);
                let co = CommitOrder::new(victim, self.config.commit_order);
                drop(g);
                // The victim is either waiting at one of the monitors or
                // inside the DBMS; a missed interrupt means the DBMS lock
                // wait breaks it instead.
                let hit = self.apply_monitor.interrupt(&ao) || self.commit_monitor.interrupt(&co);
                if !hit {
                    tracing::debug!(target: "wsrep", "victim not waiting at a monitor");
                }
                Ok(true)
            }
            TrxState::Committing
            | TrxState::Committed
            | TrxState::MustAbort
            | TrxState::MustReplay
            | TrxState::Replaying
            | TrxState::Aborting
            | TrxState::RollingBack
            | TrxState::RolledBack => Ok(false),
        }
    }

    // ----- coordination ------------------------------------------------

    /// Drains all three monitors to the current position and holds them,
    /// blocking new write sets. Returns the pause position.
    pub fn pause(&self) -> Result<Seqno> {
        let mut paused = self.paused.lock();
        if *paused {
            return Err(Error::Closed);
        }
        let local = self.last_local_seqno.load(Ordering::SeqCst).max(0);
        let position = self.certifier.position();
        self.local_monitor.drain_and_hold(local);
        self.apply_monitor.drain_and_hold(position);
        self.commit_monitor.drain_and_hold(position);
        *paused = true;
        tracing::info!(target: "wsrep", position, "pipeline paused");
        Ok(position)
    }

    /// Releases a [`pause`](Replicator::pause).
    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        if !*paused {
            return;
        }
        self.commit_monitor.resume();
        self.apply_monitor.resume();
        self.local_monitor.resume();
        *paused = false;
        tracing::info!(target: "wsrep", "pipeline resumed");
    }

    /// Causal read barrier: waits until everything ordered before the
    /// call has been applied locally, bounded by
    /// `repl.causal_read_timeout`.
    pub fn sync_wait(&self) -> Result<Seqno> {
        self.ensure_open()?;
        let target = self.certifier.position();
        if target == SEQNO_UNDEFINED {
            return Ok(SEQNO_UNDEFINED);
        }
        let deadline = Instant::now() + self.config.causal_read_timeout;
        self.apply_monitor.wait_until(target, deadline)?;
        Ok(target)
    }

    /// Runtime parameter update; only the certification toggles are
    /// dynamic.
    pub fn set_param(&self, key: &str, value: &str) -> Result<()> {
        match key {
            params::CERT_LOG_CONFLICTS => {
                let mut probe = self.config.clone();
                probe.set(key, value)?;
                self.certifier.set_log_conflicts(probe.log_conflicts);
                Ok(())
            }
            params::CERT_OPTIMISTIC_PA => {
                let mut probe = self.config.clone();
                probe.set(key, value)?;
                self.certifier.set_optimistic_pa(probe.optimistic_pa);
                Ok(())
            }
            params::REPL_COMMIT_ORDER
            | params::REPL_MAX_WS_SIZE
            | params::REPL_CAUSAL_READ_TIMEOUT
            | params::REPL_PA_RANGE => {
                Err(Error::InvalidParam { key: "static parameter", value: key.into() })
            }
            _ => Err(Error::UnknownParam(key.into())),
        }
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> Stats {
        let (cert_interval_avg, deps_dist_avg, cert_index_size) = self.certifier.stats();
        let monitor = |m: (f64, f64, f64)| MonitorStats { oooe: m.0, oool: m.1, window: m.2 };
        Stats {
            position: self.certifier.position(),
            last_committed: self.last_committed(),
            cert_interval_avg,
            deps_dist_avg,
            cert_index_size,
            local_monitor: monitor(self.local_monitor.stats()),
            apply_monitor: monitor(self.apply_monitor.stats()),
            commit_monitor: monitor(self.commit_monitor.stats()),
        }
    }

    /// Zeroes every statistics counter.
    pub fn stats_reset(&self) {
        self.certifier.stats_reset();
        self.local_monitor.stats_flush();
        self.apply_monitor.stats_flush();
        self.commit_monitor.stats_flush();
    }

    // ----- internals ---------------------------------------------------

    fn assign_buffer_order(&self, trx: &TrxHandle) {
        let g = trx.lock();
        if let Some(buffer) = g.buffer() {
            self.store.seqno_assign(buffer, g.global_seqno(), g.depends_seqno());
        }
    }

    // Reserves and releases the apply and commit slots of a write set
    // that will never apply, keeping both sequences gapless.
    fn cancel_order(&self, trx: &TrxHandle) {
        let ao = ApplyOrder::new(trx);
        let co = CommitOrder::new(trx, self.config.commit_order);
        self.apply_monitor.self_cancel(&ao);
        self.commit_monitor.self_cancel(&co);
    }

    // Commit bookkeeping shared by every terminal path: the certifier
    // releases the dependency hold (and may ask for a purge), then the
    // service thread reports our applied frontier.
    fn finish(&self, trx: &TrxHandle) {
        if let Some(purge_seqno) = self.certifier.set_trx_committed(trx) {
            let effective = self.certifier.purge_trxs_upto(purge_seqno);
            if effective >= 0 {
                self.service.release_seqno(effective);
            }
        }
        self.service.report_last_committed(self.apply_monitor.last_left());
    }

    // The transport broke total order (dropped or duplicated delivery).
    // The write set never reserved its ordered-phase slots, so only the
    // trx itself is unwound; the node stops following the group.
    fn fail_on_gap(&self, trx: &TrxHandle, err: Error) -> Result<()> {
        tracing::error!(target: "wsrep", seqno = trx.global_seqno(), %err, "certification stream broken, marking node inconsistent");
        self.certifier.mark_inconsistent();
        let mut g = trx.lock();
        Self::unwind_to_rolled_back(&mut g);
        Err(err)
    }

    // Fatal DBMS-side failure: the node can no longer follow the group.
    // `cancel_commit` is set when the commit slot was never entered and
    // must still be filled for the frontier.
    fn fail_fatally(
        &self,
        trx: &TrxHandle,
        ao: &ApplyOrder,
        cancel_commit: bool,
        what: &'static str,
        err: Error,
    ) -> Result<()> {
        tracing::error!(target: "wsrep", seqno = trx.global_seqno(), %err, "{what}, marking node inconsistent");
        self.certifier.mark_inconsistent();
        {
            let mut g = trx.lock();
            if g.state() != TrxState::MustAbort {
                g.set_state(TrxState::MustAbort);
            }
            Self::unwind_to_rolled_back(&mut g);
            g.set_apply_entered(false);
            g.set_commit_entered(false);
        }
        self.apply_monitor.leave(ao);
        if cancel_commit {
            let co = CommitOrder::new(trx, self.config.commit_order);
            self.commit_monitor.self_cancel(&co);
        }
        self.handler.rollback(trx);
        Err(Error::Inconsistent)
    }

    fn enter_consuming_cancel<P: crate::monitor::OrderPolicy>(
        monitor: &Monitor<P>,
        item: &P,
    ) -> Result<()> {
        match monitor.enter(item) {
            Ok(()) => Ok(()),
            Err(_) => monitor.enter(item),
        }
    }

    // Walks legal state-machine edges from wherever the trx is down to
    // RolledBack.
    fn unwind_to_rolled_back(g: &mut TrxGuard<'_>) {
        loop {
            match g.state() {
                TrxState::RolledBack => return,
                TrxState::Executing => g.set_state(TrxState::RollingBack),
                TrxState::RollingBack | TrxState::Aborting => g.set_state(TrxState::RolledBack),
                TrxState::Replicating | TrxState::Applying | TrxState::Committing => {
                    g.set_state(TrxState::MustAbort)
                }
                TrxState::MustAbort | TrxState::Certifying => g.set_state(TrxState::Aborting),
                // Replay was abandoned; fall back to the abort path.
                TrxState::MustReplay => g.set_state(TrxState::Replaying),
                TrxState::Replaying => g.set_state(TrxState::Applying),
                TrxState::Committed => {
                    unreachable!("rollback of a committed trx")
                }
            }
        }
    }
}

impl<T, G, H> Drop for Replicator<T, G, H> {
    fn drop(&mut self) {
        if self.certifier.is_inconsistent() {
            tracing::error!(target: "wsrep", "replicator dropped in inconsistent state");
        }
    }
}
