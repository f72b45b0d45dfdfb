//! Shared fixtures: an in-memory loopback transport, write-set store and
//! recording DBMS handler, plus a single-node harness that pumps the
//! loopback queue the way a transport receive thread would.
#![allow(missing_docs, dead_code)]

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
};
use std::thread::JoinHandle;
use std::time::Duration;
use wsrep_core::{
    BufferId, Config, EventHandler, Gtid, Key, KeyAccess, KeyPart, Replicator, Result, Seqno,
    SourceId, Transport, TrxFlags, TrxHandle, View, WriteSet, WriteSetStore,
};

pub fn node(n: u8) -> SourceId {
    SourceId::from_bytes([n; 16])
}

/// The group id used by every test cluster.
pub fn group() -> SourceId {
    node(0xee)
}

/// This node's id in single-node tests.
pub fn own_id() -> SourceId {
    node(1)
}

pub fn key_parts(keys: &[(&str, KeyAccess)]) -> Vec<KeyPart> {
    keys.iter()
        .map(|(k, a)| KeyPart::new(Key::new([k.as_bytes().to_vec()]), *a))
        .collect()
}

/// Builds an encoded remote write set.
pub fn encode_ws(
    source: SourceId,
    trx_id: u64,
    flags: TrxFlags,
    keys: &[(&str, KeyAccess)],
    last_seen: Seqno,
) -> Vec<u8> {
    WriteSet {
        flags,
        source_id: source,
        conn_id: 1,
        trx_id,
        last_seen_seqno: last_seen,
        keys: key_parts(keys),
        payload: format!("payload-{trx_id}").into_bytes(),
    }
    .encode()
}

// ---------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct LoopbackTransport {
    pub queue: Mutex<VecDeque<Vec<u8>>>,
    pub reported: Mutex<Vec<Gtid>>,
}

impl Transport for LoopbackTransport {
    fn send(&self, data: &[u8]) -> Result<()> {
        self.queue.lock().push_back(data.to_vec());
        Ok(())
    }

    fn report_last_committed(&self, gtid: Gtid) {
        self.reported.lock().push(gtid);
    }
}

#[derive(Default)]
struct MemStoreInner {
    next: u64,
    bufs: HashMap<u64, (Vec<u8>, Seqno)>,
    release_calls: Vec<Seqno>,
    freed: usize,
}

/// In-memory gcache stand-in that tracks every release.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn live_buffers(&self) -> usize {
        self.inner.lock().bufs.len()
    }

    pub fn freed(&self) -> usize {
        self.inner.lock().freed
    }

    pub fn release_calls(&self) -> Vec<Seqno> {
        self.inner.lock().release_calls.clone()
    }
}

impl WriteSetStore for MemStore {
    fn alloc(&self, data: &[u8]) -> Result<BufferId> {
        let mut inner = self.inner.lock();
        inner.next += 1;
        let id = inner.next;
        inner.bufs.insert(id, (data.to_vec(), wsrep_core::SEQNO_UNDEFINED));
        Ok(BufferId(id))
    }

    fn get(&self, id: BufferId) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .bufs
            .get(&id.0)
            .map(|(data, _)| data.clone())
            .ok_or(wsrep_core::Error::Corrupt("unknown buffer"))
    }

    fn seqno_assign(&self, id: BufferId, global_seqno: Seqno, _depends_seqno: Seqno) {
        if let Some(entry) = self.inner.lock().bufs.get_mut(&id.0) {
            entry.1 = global_seqno;
        }
    }

    fn seqno_release(&self, seqno: Seqno) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.release_calls.push(seqno);
        let before = inner.bufs.len();
        inner.bufs.retain(|_, (_, s)| *s < 0 || *s > seqno);
        inner.freed += before - inner.bufs.len();
        Ok(())
    }

    fn free(&self, id: BufferId) {
        let mut inner = self.inner.lock();
        if inner.bufs.remove(&id.0).is_some() {
            inner.freed += 1;
        }
    }
}

/// Records every DBMS callback; can hold the apply of one seqno to probe
/// ordering windows.
#[derive(Default)]
pub struct RecordingHandler {
    pub applied: Mutex<Vec<Seqno>>,
    pub committed: Mutex<Vec<Seqno>>,
    pub rolled_back: Mutex<Vec<Seqno>>,
    pub views: Mutex<Vec<Gtid>>,
    concurrent: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    hold: Mutex<Option<Seqno>>,
    hold_cv: Condvar,
}

impl RecordingHandler {
    /// Makes the next apply of `seqno` block until
    /// [`release_holds`](RecordingHandler::release_holds).
    pub fn hold_apply(&self, seqno: Seqno) {
        *self.hold.lock() = Some(seqno);
    }

    pub fn release_holds(&self) {
        *self.hold.lock() = None;
        self.hold_cv.notify_all();
    }

    pub fn applied_seqnos(&self) -> Vec<Seqno> {
        self.applied.lock().clone()
    }

    pub fn committed_seqnos(&self) -> Vec<Seqno> {
        self.committed.lock().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn apply(&self, trx: &TrxHandle, _payload: &[u8]) -> Result<()> {
        let seqno = trx.global_seqno();
        let running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);

        {
            let mut hold = self.hold.lock();
            while hold.is_some_and(|h| h == seqno) {
                self.hold_cv.wait(&mut hold);
            }
        }

        self.applied.lock().push(seqno);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self, trx: &TrxHandle) -> Result<()> {
        self.committed.lock().push(trx.global_seqno());
        Ok(())
    }

    fn rollback(&self, trx: &TrxHandle) {
        self.rolled_back.lock().push(trx.global_seqno());
    }

    fn view_change(&self, view: &View) {
        self.views.lock().push(view.id);
    }
}

// ---------------------------------------------------------------------
// Single-node harness
// ---------------------------------------------------------------------

pub type TestReplicator = Replicator<LoopbackTransport, MemStore, RecordingHandler>;

/// One replicator wired to in-memory collaborators, with a pump thread
/// standing in for the transport receive loop.
pub struct TestNode {
    pub repl: Arc<TestReplicator>,
    pub transport: Arc<LoopbackTransport>,
    pub store: Arc<MemStore>,
    pub handler: Arc<RecordingHandler>,
    next_global: Arc<AtomicI64>,
    next_local: Arc<AtomicI64>,
    pump_stop: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TestNode {
    pub fn new(config: Config) -> Self {
        let transport = Arc::new(LoopbackTransport::default());
        let store = Arc::new(MemStore::default());
        let handler = Arc::new(RecordingHandler::default());
        let repl = Arc::new(Replicator::new(
            config,
            own_id(),
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&handler),
        ));
        repl.connect(Gtid::new(group(), 0));
        Self {
            repl,
            transport,
            store,
            handler,
            next_global: Arc::new(AtomicI64::new(0)),
            next_local: Arc::new(AtomicI64::new(0)),
            pump_stop: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        }
    }

    /// Claims the next (global, local) seqno pair.
    pub fn next_seqnos(&self) -> (Seqno, Seqno) {
        (
            self.next_global.fetch_add(1, Ordering::SeqCst) + 1,
            self.next_local.fetch_add(1, Ordering::SeqCst) + 1,
        )
    }

    /// Delivers a remote write set inline, driving the full pipeline on
    /// the calling thread.
    pub fn deliver_remote(
        &self,
        source: SourceId,
        trx_id: u64,
        flags: TrxFlags,
        keys: &[(&str, KeyAccess)],
        last_seen: Seqno,
    ) -> Result<Seqno> {
        let data = encode_ws(source, trx_id, flags, keys, last_seen);
        let (gs, ls) = self.next_seqnos();
        self.repl.process_writeset(gs, ls, &data)?;
        Ok(gs)
    }

    /// Starts a thread that delivers loopback submissions in order, the
    /// way the transport receive loop would.
    pub fn start_pump(&self) {
        let transport = Arc::clone(&self.transport);
        let repl = Arc::clone(&self.repl);
        let next_global = Arc::clone(&self.next_global);
        let next_local = Arc::clone(&self.next_local);
        let stop = Arc::clone(&self.pump_stop);
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let data = transport.queue.lock().pop_front();
                match data {
                    Some(data) => {
                        let gs = next_global.fetch_add(1, Ordering::SeqCst) + 1;
                        let ls = next_local.fetch_add(1, Ordering::SeqCst) + 1;
                        let _ = repl.process_writeset(gs, ls, &data);
                    }
                    None => std::thread::sleep(Duration::from_millis(1)),
                }
            }
        });
        *self.pump.lock() = Some(handle);
    }

    pub fn stop_pump(&self) {
        self.pump_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pump.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
