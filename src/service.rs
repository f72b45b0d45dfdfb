use crate::{
    provider::{Transport, WriteSetStore},
    seqno::{Gtid, SEQNO_UNDEFINED, Seqno, SourceId},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{Receiver, Sender, SyncSender, channel, sync_channel},
};

/// Report an applied position to the group.
pub(crate) struct ReportCommitted {
    pub(crate) seqno: Seqno,
}

/// Release write-set buffers up to and including a seqno.
pub(crate) struct ReleaseSeqno {
    pub(crate) seqno: Seqno,
}

/// Drain the queue, then install a new group id for later reports.
pub(crate) struct Flush {
    pub(crate) group: SourceId,
    pub(crate) ack: SyncSender<()>,
}

/// Messages consumed by the service thread, strictly in order.
pub(crate) enum ServiceEvent {
    ReportCommitted(ReportCommitted),
    ReleaseSeqno(ReleaseSeqno),
    Flush(Flush),
    /// Forget the reported position (transport reconnect).
    Reset,
}

impl From<ReportCommitted> for ServiceEvent {
    fn from(ev: ReportCommitted) -> Self {
        ServiceEvent::ReportCommitted(ev)
    }
}

impl From<ReleaseSeqno> for ServiceEvent {
    fn from(ev: ReleaseSeqno) -> Self {
        ServiceEvent::ReleaseSeqno(ev)
    }
}

impl From<Flush> for ServiceEvent {
    fn from(ev: Flush) -> Self {
        ServiceEvent::Flush(ev)
    }
}

/// Handle to the service thread.
///
/// The pipeline posts fire-and-forget events from inside the monitors;
/// the service thread performs the slow outbound work (reporting the
/// applied position, releasing cache buffers) off the hot path but in
/// posting order, which keeps "apply finished" and "buffer released"
/// correctly sequenced.
#[derive(Clone)]
pub(crate) struct ServiceHandle {
    sender: Sender<ServiceEvent>,
}

impl ServiceHandle {
    pub(crate) fn send<T: Into<ServiceEvent>>(&self, msg: T) {
        // A dropped receiver means the service thread died on a fatal
        // store error; the poisoned flag is already set, nothing to do.
        let _ = self.sender.send(msg.into());
    }

    /// Schedules `seqno` to be reported as last committed.
    pub(crate) fn report_last_committed(&self, seqno: Seqno) {
        self.send(ReportCommitted { seqno });
    }

    /// Schedules release of write-set buffers up to `seqno`.
    pub(crate) fn release_seqno(&self, seqno: Seqno) {
        self.send(ReleaseSeqno { seqno });
    }

    /// Blocks until every previously posted event has been handled, then
    /// installs `group` as the id for later reports.
    ///
    /// Must only be called with the monitors drained, so no new events
    /// can race past the flush point.
    pub(crate) fn flush(&self, group: SourceId) {
        let (ack, done) = sync_channel(0);
        self.send(Flush { group, ack });
        // Err means the thread is gone; shutdown is handled elsewhere.
        let _ = done.recv();
    }

    /// Forgets the reported position before a transport reconnect.
    pub(crate) fn reset(&self) {
        self.send(ServiceEvent::Reset);
    }
}

/// The background half: consumes events until every handle is dropped.
pub(crate) struct ServiceThd<T, G> {
    transport: Arc<T>,
    store: Arc<G>,
    rx: Receiver<ServiceEvent>,
    poisoned: Arc<AtomicBool>,
    group: SourceId,
    last_reported: Seqno,
}

impl<T, G> ServiceThd<T, G>
where
    T: Transport + 'static,
    G: WriteSetStore + 'static,
{
    /// Spawns the listener thread and returns the posting handle.
    ///
    /// `poisoned` is latched when the store fails a release: the node can
    /// no longer trust its cache and must stop processing.
    pub(crate) fn spawn(
        transport: Arc<T>,
        store: Arc<G>,
        poisoned: Arc<AtomicBool>,
    ) -> ServiceHandle {
        let (tx, rx) = channel();
        let thd = Self {
            transport,
            store,
            rx,
            poisoned,
            group: SourceId::UNDEFINED,
            last_reported: SEQNO_UNDEFINED,
        };
        thd.start_listener();
        ServiceHandle { sender: tx }
    }

    fn handle_report(&mut self, ReportCommitted { seqno }: ReportCommitted) {
        if seqno <= self.last_reported || self.group == SourceId::UNDEFINED {
            return;
        }
        self.last_reported = seqno;
        self.transport.report_last_committed(Gtid::new(self.group, seqno));
    }

    fn handle_release(&mut self, ReleaseSeqno { seqno }: ReleaseSeqno) {
        if let Err(err) = self.store.seqno_release(seqno) {
            tracing::error!(target: "wsrep", seqno, %err, "write set release failed, marking node inconsistent");
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }

    fn handle_flush(&mut self, Flush { group, ack }: Flush) {
        tracing::debug!(target: "wsrep", %group, "service queue flushed");
        self.group = group;
        let _ = ack.send(());
    }

    fn handle_reset(&mut self) {
        self.group = SourceId::UNDEFINED;
        self.last_reported = SEQNO_UNDEFINED;
    }

    /// Runs the event loop on a named thread; exits when every sender is
    /// gone.
    fn start_listener(mut self) {
        let task = move || {
            while let Ok(msg) = self.rx.recv() {
                match msg {
                    ServiceEvent::ReportCommitted(ev) => self.handle_report(ev),
                    ServiceEvent::ReleaseSeqno(ev) => self.handle_release(ev),
                    ServiceEvent::Flush(ev) => self.handle_flush(ev),
                    ServiceEvent::Reset => self.handle_reset(),
                }
            }
        };
        std::thread::Builder::new()
            .name("wsrep-service".to_string())
            .spawn(task)
            .expect("failed to spawn service thread");
    }
}
