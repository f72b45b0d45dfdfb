use bitflags::bitflags;

bitflags! {
    /// Write-set flag word, carried verbatim on the wire.
    ///
    /// `BEGIN`/`COMMIT` frame a transaction; a write set carrying both is a
    /// complete transaction in one fragment, which is the common case.
    /// `ISOLATION` requests total-order execution with no concurrency; the
    /// combinations `ISOLATION|BEGIN` (without `COMMIT`) and
    /// `ISOLATION|COMMIT` (without `BEGIN`) delimit a non-blocking
    /// operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrxFlags: u32 {
        /// Transaction commit fragment.
        const COMMIT        = 1 << 0;
        /// Voluntary rollback; the write set must not apply.
        const ROLLBACK      = 1 << 1;
        /// Total-order isolation.
        const ISOLATION     = 1 << 2;
        /// Not safe for parallel apply; forces serial ordering.
        const PA_UNSAFE     = 1 << 3;
        /// Commutative with concurrent write sets.
        const COMMUTATIVE   = 1 << 4;
        /// Transaction start fragment.
        const BEGIN         = 1 << 6;
        /// Two-phase-commit prepare fragment.
        const PREPARE       = 1 << 7;
        /// Snapshot read marker.
        const SNAPSHOT      = 1 << 8;
        /// Dependencies implied by the originator; certification must not
        /// weaken them.
        const IMPLICIT_DEPS = 1 << 9;
        /// Externally ordered before replication.
        const PREORDERED    = 1 << 15;
    }
}

impl TrxFlags {
    /// Flag combination of an explicit client rollback write set.
    pub const EXPLICIT_ROLLBACK: TrxFlags = TrxFlags::PA_UNSAFE.union(TrxFlags::ROLLBACK);

    /// Total-order-isolation write set.
    pub fn is_toi(self) -> bool {
        self.contains(TrxFlags::ISOLATION)
    }

    /// Start fragment of a non-blocking operation.
    pub fn is_nbo_start(self) -> bool {
        self.contains(TrxFlags::ISOLATION | TrxFlags::BEGIN) && !self.contains(TrxFlags::COMMIT)
    }

    /// End fragment of a non-blocking operation.
    pub fn is_nbo_end(self) -> bool {
        self.contains(TrxFlags::ISOLATION | TrxFlags::COMMIT) && !self.contains(TrxFlags::BEGIN)
    }

    /// A complete transaction in a single write set.
    pub fn is_complete(self) -> bool {
        self.contains(TrxFlags::BEGIN | TrxFlags::COMMIT)
    }
}
