use crate::{
    error::{Error, Result},
    seqno::{SEQNO_UNDEFINED, Seqno},
    trx::TrxHandle,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// Ordering predicate of a [`Monitor`] instantiation.
///
/// A policy value is a small snapshot of the ordering-relevant fields of
/// one transaction. The monitor keeps a copy per occupied slot so it can
/// re-evaluate the predicate for every waiter whenever `last_left`
/// advances.
pub trait OrderPolicy: Clone + Send {
    /// The seqno that keys this item's slot.
    fn seqno(&self) -> Seqno;

    /// Whether the item may enter its critical section given the
    /// monitor's current frontier.
    fn may_enter(&self, last_entered: Seqno, last_left: Seqno) -> bool;
}

/// Strict FIFO on the local delivery order; serializes certification.
#[derive(Debug, Clone, Copy)]
pub struct LocalOrder {
    seqno: Seqno,
}

impl LocalOrder {
    /// Orders by the transaction's local seqno.
    pub fn new(trx: &TrxHandle) -> Self {
        Self { seqno: trx.local_seqno() }
    }

    /// Orders by an explicit local seqno.
    pub fn with_seqno(seqno: Seqno) -> Self {
        Self { seqno }
    }
}

impl OrderPolicy for LocalOrder {
    fn seqno(&self) -> Seqno {
        self.seqno
    }

    fn may_enter(&self, _last_entered: Seqno, last_left: Seqno) -> bool {
        last_left + 1 == self.seqno
    }
}

/// Dependency-bounded parallel apply order.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOrder {
    global_seqno: Seqno,
    depends_seqno: Seqno,
    local: bool,
    toi: bool,
}

impl ApplyOrder {
    /// Snapshots the ordering fields of a certified transaction.
    pub fn new(trx: &TrxHandle) -> Self {
        Self {
            global_seqno: trx.global_seqno(),
            depends_seqno: trx.depends_seqno(),
            local: trx.is_local(),
            toi: trx.is_toi(),
        }
    }

    /// Builds from explicit fields.
    pub fn with_seqnos(global_seqno: Seqno, depends_seqno: Seqno, local: bool) -> Self {
        Self { global_seqno, depends_seqno, local, toi: false }
    }
}

impl OrderPolicy for ApplyOrder {
    fn seqno(&self) -> Seqno {
        self.global_seqno
    }

    fn may_enter(&self, _last_entered: Seqno, last_left: Seqno) -> bool {
        // A local transaction already holds its own changes; its slot is
        // bookkeeping only. Total-order isolation always waits for its
        // full dependency range.
        (self.local && !self.toi) || last_left >= self.depends_seqno
    }
}

/// Commit-order policy selector, `repl.commit_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CommitPolicy {
    /// No commit ordering at all; the monitor is disabled.
    Bypass = 0,
    /// Out-of-order commit allowed for everyone.
    Oooc = 1,
    /// Only local transactions may overtake.
    LocalOooc = 2,
    /// Strict global-seqno commit order.
    #[default]
    NoOooc = 3,
}

impl CommitPolicy {
    /// Parses the numeric wire form (0..=3).
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(CommitPolicy::Bypass),
            1 => Some(CommitPolicy::Oooc),
            2 => Some(CommitPolicy::LocalOooc),
            3 => Some(CommitPolicy::NoOooc),
            _ => None,
        }
    }
}

/// Commit order item.
#[derive(Debug, Clone, Copy)]
pub struct CommitOrder {
    global_seqno: Seqno,
    local: bool,
    policy: CommitPolicy,
}

impl CommitOrder {
    /// Snapshots the commit-ordering fields of a transaction.
    pub fn new(trx: &TrxHandle, policy: CommitPolicy) -> Self {
        Self { global_seqno: trx.global_seqno(), local: trx.is_local(), policy }
    }

    /// Builds from explicit fields.
    pub fn with_seqno(global_seqno: Seqno, local: bool, policy: CommitPolicy) -> Self {
        Self { global_seqno, local, policy }
    }
}

impl OrderPolicy for CommitOrder {
    fn seqno(&self) -> Seqno {
        self.global_seqno
    }

    fn may_enter(&self, _last_entered: Seqno, last_left: Seqno) -> bool {
        match self.policy {
            CommitPolicy::Bypass => {
                unreachable!("commit order condition evaluated in bypass mode")
            }
            CommitPolicy::Oooc => true,
            CommitPolicy::LocalOooc => self.local || last_left + 1 == self.global_seqno,
            CommitPolicy::NoOooc => last_left + 1 == self.global_seqno,
        }
    }
}

/// Operating mode; in bypass every operation is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal gated operation.
    Normal,
    /// Monitor disabled.
    Bypass,
}

/// Sentinel for "no drain in progress".
const DRAIN_NONE: Seqno = Seqno::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Waiting,
    Canceled,
    Applying,
    Finished,
}

struct Inner<P> {
    mode: Mode,
    last_entered: Seqno,
    last_left: Seqno,
    drain_seqno: Seqno,
    slots: Box<[SlotState]>,
    items: Box<[Option<P>]>,
    entered: u64,
    oooe: u64,
    oool: u64,
    win_size: u64,
}

/// Ring-buffer ordering primitive.
///
/// Gates up to `size` concurrent seqnos so that each enters its critical
/// section only when the policy predicate over `(last_entered, last_left)`
/// holds, and tracks the contiguous frontier of seqnos that have left.
/// Slots are reused modulo `size`; the window-full wait in
/// [`enter`](Monitor::enter) is the pipeline's only backpressure.
pub struct Monitor<P> {
    size: usize,
    mask: usize,
    lock: Mutex<Inner<P>>,
    // Window/drain waiters.
    cond: Condvar,
    // Per-slot: waiters inside enter().
    enter_cond: Box<[Condvar]>,
    // Per-slot: waiters in wait(seqno), signaled when last_left crosses
    // the slot's seqno.
    wait_cond: Box<[Condvar]>,
}

impl<P: OrderPolicy> Monitor<P> {
    /// Creates a monitor with a window of `size` slots (power of two).
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "monitor size must be a power of two");
        Self {
            size,
            mask: size - 1,
            lock: Mutex::new(Inner {
                mode: Mode::Normal,
                last_entered: SEQNO_UNDEFINED,
                last_left: SEQNO_UNDEFINED,
                drain_seqno: DRAIN_NONE,
                slots: vec![SlotState::Idle; size].into_boxed_slice(),
                items: (0..size).map(|_| None).collect(),
                entered: 0,
                oooe: 0,
                oool: 0,
                win_size: 0,
            }),
            cond: Condvar::new(),
            enter_cond: (0..size).map(|_| Condvar::new()).collect(),
            wait_cond: (0..size).map(|_| Condvar::new()).collect(),
        }
    }

    /// Window capacity.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Switches between normal and bypass operation.
    pub fn assign_mode(&self, mode: Mode) {
        self.lock.lock().mode = mode;
    }

    fn index_of(&self, seqno: Seqno) -> usize {
        debug_assert!(seqno >= 0);
        seqno as usize & self.mask
    }

    fn would_block(&self, g: &Inner<P>, seqno: Seqno) -> bool {
        seqno - g.last_left >= self.size as Seqno || seqno > g.drain_seqno
    }

    /// Waits for ordering, then enters the critical section.
    ///
    /// Returns [`Error::Interrupted`] if the slot was canceled by
    /// [`interrupt`](Monitor::interrupt) before the predicate passed.
    pub fn enter(&self, item: &P) -> Result<()> {
        let seqno = item.seqno();
        let idx = self.index_of(seqno);
        let mut g = self.lock.lock();
        if g.mode == Mode::Bypass {
            return Ok(());
        }
        debug_assert!(seqno > g.last_left, "enter({seqno}) at or below last left {}", g.last_left);

        self.pre_enter(&mut g, seqno);

        if g.slots[idx] != SlotState::Canceled {
            debug_assert_eq!(g.slots[idx], SlotState::Idle, "slot collision at seqno {seqno}");

            g.slots[idx] = SlotState::Waiting;
            g.items[idx] = Some(item.clone());

            while !item.may_enter(g.last_entered, g.last_left)
                && g.slots[idx] == SlotState::Waiting
            {
                self.enter_cond[idx].wait(&mut g);
            }

            if g.slots[idx] != SlotState::Canceled {
                debug_assert!(matches!(g.slots[idx], SlotState::Waiting | SlotState::Applying));
                g.slots[idx] = SlotState::Applying;
                g.entered += 1;
                g.oooe += u64::from(g.last_left + 1 < seqno);
                g.win_size += (g.last_entered - g.last_left) as u64;
                return Ok(());
            }
        }

        g.slots[idx] = SlotState::Idle;
        g.items[idx] = None;
        tracing::trace!(target: "wsrep", seqno, "monitor enter canceled");
        Err(Error::Interrupted)
    }

    /// Leaves the critical section, advancing the contiguous frontier and
    /// waking every waiter whose predicate now passes.
    pub fn leave(&self, item: &P) {
        let seqno = item.seqno();
        let mut g = self.lock.lock();
        if g.mode == Mode::Bypass {
            return;
        }
        debug_assert!(matches!(
            g.slots[self.index_of(seqno)],
            SlotState::Applying | SlotState::Canceled
        ));
        self.post_leave(&mut g, seqno);
    }

    /// Reserves and immediately releases the slot of a transaction that
    /// must not apply, keeping the seqno sequence gapless.
    pub fn self_cancel(&self, item: &P) {
        let seqno = item.seqno();
        let idx = self.index_of(seqno);
        let mut g = self.lock.lock();
        if g.mode == Mode::Bypass {
            return;
        }
        debug_assert!(seqno > g.last_left);

        while seqno - g.last_left >= self.size as Seqno {
            tracing::warn!(
                target: "wsrep",
                seqno,
                last_left = g.last_left,
                size = self.size,
                "self-cancel outside monitor window, waiting"
            );
            self.cond.wait(&mut g);
        }

        debug_assert!(matches!(g.slots[idx], SlotState::Idle | SlotState::Canceled));
        g.slots[idx] = SlotState::Idle;

        if g.last_entered < seqno {
            g.last_entered = seqno;
        }

        if seqno <= g.drain_seqno {
            self.post_leave(&mut g, seqno);
        } else {
            // Leave a marker for the frontier chain past the drain point.
            g.slots[idx] = SlotState::Finished;
        }
    }

    /// Cancels a slot that has not yet entered its critical section.
    ///
    /// Returns whether the cancellation took effect; an `Applying` slot is
    /// left alone.
    pub fn interrupt(&self, item: &P) -> bool {
        let seqno = item.seqno();
        let idx = self.index_of(seqno);
        let mut g = self.lock.lock();
        if g.mode == Mode::Bypass {
            return false;
        }

        while seqno - g.last_left >= self.size as Seqno {
            self.cond.wait(&mut g);
        }

        if (g.slots[idx] == SlotState::Idle && seqno > g.last_left)
            || g.slots[idx] == SlotState::Waiting
        {
            g.slots[idx] = SlotState::Canceled;
            self.enter_cond[idx].notify_one();
            true
        } else {
            tracing::debug!(
                target: "wsrep",
                seqno,
                state = ?g.slots[idx],
                last_entered = g.last_entered,
                last_left = g.last_left,
                "interrupt missed"
            );
            false
        }
    }

    /// Waits until every seqno up to and including `seqno` has left, then
    /// releases the gate. At most one drain runs at a time.
    pub fn drain(&self, seqno: Seqno) {
        let mut g = self.lock.lock();
        while g.drain_seqno != DRAIN_NONE {
            self.cond.wait(&mut g);
        }
        self.drain_common(&mut g, seqno);
        // Stale canceled-then-finished entries may sit right above the
        // frontier.
        self.update_last_left(&mut g);
        g.drain_seqno = DRAIN_NONE;
        self.cond.notify_all();
    }

    /// Like [`drain`](Monitor::drain), but keeps the gate closed so that
    /// no seqno beyond `seqno` can enter until [`resume`](Monitor::resume).
    pub fn drain_and_hold(&self, seqno: Seqno) {
        let mut g = self.lock.lock();
        while g.drain_seqno != DRAIN_NONE {
            self.cond.wait(&mut g);
        }
        self.drain_common(&mut g, seqno);
    }

    /// Reopens the gate closed by [`drain_and_hold`](Monitor::drain_and_hold).
    pub fn resume(&self) {
        let mut g = self.lock.lock();
        debug_assert!(g.drain_seqno != DRAIN_NONE, "resume without a held drain");
        g.drain_seqno = DRAIN_NONE;
        self.cond.notify_all();
    }

    /// Blocks until the contiguous frontier reaches `seqno`.
    pub fn wait(&self, seqno: Seqno) {
        let idx = self.index_of(seqno);
        let mut g = self.lock.lock();
        while g.last_left < seqno {
            self.wait_cond[idx].wait(&mut g);
        }
    }

    /// Bounded [`wait`](Monitor::wait); fails with [`Error::Timeout`] if
    /// the frontier does not reach `seqno` by the deadline.
    pub fn wait_until(&self, seqno: Seqno, deadline: Instant) -> Result<()> {
        let idx = self.index_of(seqno);
        let mut g = self.lock.lock();
        while g.last_left < seqno {
            if self.wait_cond[idx].wait_until(&mut g, deadline).timed_out() {
                return Err(Error::Timeout { seqno });
            }
        }
        Ok(())
    }

    /// Resets or fast-forwards the frontier. The monitor must be drained
    /// before moving it backwards.
    pub fn assign_initial_position(&self, seqno: Seqno) {
        let mut g = self.lock.lock();
        if g.last_entered == SEQNO_UNDEFINED || seqno == SEQNO_UNDEFINED {
            // First call or explicit reset.
            g.last_entered = seqno;
            g.last_left = seqno;
        } else {
            if g.last_left < seqno {
                g.last_left = seqno;
            }
            if g.last_entered < g.last_left {
                g.last_entered = g.last_left;
            }
        }
        tracing::debug!(target: "wsrep", seqno, "monitor position assigned");
        // Some drainers may wait for us here.
        self.cond.notify_all();
        if seqno != SEQNO_UNDEFINED {
            self.wait_cond[self.index_of(seqno)].notify_all();
        }
    }

    /// Highest seqno that has entered.
    pub fn last_entered(&self) -> Seqno {
        self.lock.lock().last_entered
    }

    /// Contiguous frontier: every seqno at or below it has left.
    pub fn last_left(&self) -> Seqno {
        self.lock.lock().last_left
    }

    /// Whether `enter(seqno)` would currently block on the window.
    pub fn would_block_at(&self, seqno: Seqno) -> bool {
        let g = self.lock.lock();
        self.would_block(&g, seqno)
    }

    /// Out-of-order ratios and mean window: `(oooe, oool, win)` fractions
    /// over all entered items.
    pub fn stats(&self) -> (f64, f64, f64) {
        let g = self.lock.lock();
        if g.entered > 0 {
            let n = g.entered as f64;
            (g.oooe as f64 / n, g.oool as f64 / n, g.win_size as f64 / n)
        } else {
            (0.0, 0.0, 0.0)
        }
    }

    /// Zeroes the statistics counters.
    pub fn stats_flush(&self) {
        let mut g = self.lock.lock();
        g.entered = 0;
        g.oooe = 0;
        g.oool = 0;
        g.win_size = 0;
    }

    // Waits until the slot can be reserved, then raises last_entered.
    fn pre_enter(&self, g: &mut MutexGuard<'_, Inner<P>>, seqno: Seqno) {
        debug_assert!(g.last_left <= g.last_entered);
        while self.would_block(g, seqno) {
            self.cond.wait(g);
        }
        if g.last_entered < seqno {
            g.last_entered = seqno;
        }
    }

    fn post_leave(&self, g: &mut MutexGuard<'_, Inner<P>>, seqno: Seqno) {
        let idx = self.index_of(seqno);

        if g.last_left + 1 == seqno {
            g.slots[idx] = SlotState::Idle;
            g.items[idx] = None;
            g.last_left = seqno;
            self.wait_cond[idx].notify_all();

            self.update_last_left(g);
            g.oool += u64::from(g.last_left > seqno);
            self.wake_up_next(g);
        } else {
            g.slots[idx] = SlotState::Finished;
            g.items[idx] = None;
        }

        debug_assert!(
            g.last_left != g.last_entered
                || g.slots[self.index_of(g.last_left)] == SlotState::Idle
        );

        if g.last_left >= seqno || g.last_left >= g.drain_seqno {
            // Window shrank, or a drainer waits for this frontier.
            self.cond.notify_all();
        }
    }

    // Advances the frontier through contiguous finished slots.
    fn update_last_left(&self, g: &mut MutexGuard<'_, Inner<P>>) {
        let mut i = g.last_left + 1;
        while i <= g.last_entered {
            let idx = self.index_of(i);
            if g.slots[idx] == SlotState::Finished {
                g.slots[idx] = SlotState::Idle;
                g.items[idx] = None;
                g.last_left = i;
                self.wait_cond[idx].notify_all();
                i += 1;
            } else {
                break;
            }
        }
        debug_assert!(g.last_left <= g.last_entered);
    }

    // Re-evaluates every waiter in the window and signals those whose
    // predicate now passes.
    fn wake_up_next(&self, g: &mut MutexGuard<'_, Inner<P>>) {
        let (last_entered, last_left) = (g.last_entered, g.last_left);
        for i in (last_left + 1)..=last_entered {
            let idx = self.index_of(i);
            let passes = g.slots[idx] == SlotState::Waiting
                && g.items[idx].as_ref().is_some_and(|it| it.may_enter(last_entered, last_left));
            if passes {
                // Transition here: if this is last_left + 1 and interrupt
                // raced us after the signal, nobody would be left to
                // advance the frontier.
                g.slots[idx] = SlotState::Applying;
                self.enter_cond[idx].notify_one();
            }
        }
    }

    fn drain_common(&self, g: &mut MutexGuard<'_, Inner<P>>, seqno: Seqno) {
        tracing::debug!(target: "wsrep", seqno, "draining monitor");
        g.drain_seqno = seqno;
        if g.last_left > seqno {
            tracing::warn!(
                target: "wsrep",
                last_left = g.last_left,
                drain_seqno = seqno,
                "frontier already past drain point"
            );
        }
        while g.last_left < g.drain_seqno {
            self.cond.wait(g);
        }
    }
}

impl<P> Drop for Monitor<P> {
    fn drop(&mut self) {
        let g = self.lock.get_mut();
        if g.entered > 0 {
            tracing::debug!(
                target: "wsrep",
                entered = g.entered,
                oooe_fraction = g.oooe as f64 / g.entered as f64,
                oool_fraction = g.oool as f64 / g.entered as f64,
                "monitor retired"
            );
        }
    }
}
