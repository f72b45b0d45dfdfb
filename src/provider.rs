use crate::{
    error::Result,
    seqno::{Gtid, Seqno, SourceId},
    trx::TrxHandle,
};

/// Opaque handle to a write-set buffer held by the [`WriteSetStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Group membership snapshot delivered on a configuration change.
#[derive(Debug, Clone)]
pub struct View {
    /// Identity of the new configuration: the group id plus the seqno at
    /// which it takes effect.
    pub id: Gtid,
    /// Members of the new configuration.
    pub members: Vec<SourceId>,
    /// This node's index in `members`.
    pub own_index: usize,
    /// Whether the configuration is a primary component.
    pub primary: bool,
}

/// Outbound half of the group communication layer.
///
/// Delivery is push-based: the embedder reads from its transport and
/// feeds ordered events into `Replicator::process_*` from its applier
/// threads. This trait only covers what the core itself initiates.
pub trait Transport: Send + Sync {
    /// Submits a write set for total-order broadcast. Delivery is
    /// correlated through the trx id embedded in the write set.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Reports the position up to which this node has fully applied, for
    /// group-wide flow control and safe-to-discard agreement.
    fn report_last_committed(&self, gtid: Gtid);
}

/// The write-set cache.
///
/// Delivered write sets live here between certification and purge, so
/// that joining nodes can be served incremental state transfer from the
/// cache rather than a full snapshot.
pub trait WriteSetStore: Send + Sync {
    /// Stores a write set, returning its buffer handle.
    fn alloc(&self, data: &[u8]) -> Result<BufferId>;

    /// Reads a stored write set back.
    fn get(&self, id: BufferId) -> Result<Vec<u8>>;

    /// Binds a delivered buffer to its global ordering.
    fn seqno_assign(&self, id: BufferId, global_seqno: Seqno, depends_seqno: Seqno);

    /// Releases every buffer ordered at or below `seqno`.
    fn seqno_release(&self, seqno: Seqno) -> Result<()>;

    /// Frees a buffer that never got ordered (failed replication).
    fn free(&self, id: BufferId);
}

/// The DBMS boundary: callbacks invoked inside the ordered phases.
pub trait EventHandler: Send + Sync {
    /// Applies a write set. Invoked inside the apply monitor; concurrent
    /// invocations only happen for write sets with disjoint dependency
    /// ranges.
    fn apply(&self, trx: &TrxHandle, payload: &[u8]) -> Result<()>;

    /// Commits an applied write set. Invoked inside the commit monitor,
    /// subject to the configured commit-order policy.
    fn commit(&self, trx: &TrxHandle) -> Result<()>;

    /// Rolls back a transaction that was brute-force aborted after it had
    /// started applying.
    fn rollback(&self, trx: &TrxHandle);

    /// Observes a configuration change. Called with all monitors drained.
    fn view_change(&self, view: &View);
}
