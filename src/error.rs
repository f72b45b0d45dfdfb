use crate::seqno::Seqno;

/// Errors surfaced by the replication core.
///
/// Recoverable conditions ([`CertificationFailed`](Error::CertificationFailed),
/// [`Interrupted`](Error::Interrupted)) travel back to the client thread as
/// ordinary results; the transaction itself has already been unwound into a
/// rollback by the time the error is returned. [`Inconsistent`](Error::Inconsistent)
/// is fatal: once set, every subsequent operation fails with it and the
/// embedder is expected to close the replicator and leave the cluster.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The write set conflicted with a concurrent write set it had not seen.
    #[error("certification failed for write set {seqno}")]
    CertificationFailed {
        /// Global seqno of the failed write set.
        seqno: Seqno,
    },

    /// The operation was canceled by a brute-force abort (or shutdown).
    #[error("interrupted by brute-force abort")]
    Interrupted,

    /// The node has diverged from the group and must not process further
    /// write sets.
    #[error("node marked inconsistent")]
    Inconsistent,

    /// A write set could not be decoded.
    #[error("corrupt write set: {0}")]
    Corrupt(&'static str),

    /// The write set exceeds `repl.max_ws_size`.
    #[error("write set size {size} exceeds maximum {max}")]
    WriteSetTooLarge {
        /// Encoded size of the offending write set.
        size: usize,
        /// Configured `repl.max_ws_size`.
        max: usize,
    },

    /// A bounded wait (causal read, drain) did not finish in time.
    #[error("timed out waiting for seqno {seqno}")]
    Timeout {
        /// The seqno that was waited for.
        seqno: Seqno,
    },

    /// Unknown configuration parameter name.
    #[error("unknown parameter {0:?}")]
    UnknownParam(String),

    /// A configuration parameter was given an unparsable value.
    #[error("invalid value {value:?} for parameter {key}")]
    InvalidParam {
        /// Parameter name.
        key: &'static str,
        /// Rejected value.
        value: String,
    },

    /// The transport delivered a write set out of sequence: a dropped or
    /// duplicated delivery that certification must not paper over.
    #[error("seqno gap in certification stream: expected {expected}, got {got}")]
    SeqnoGap {
        /// The position the certifier was waiting for.
        expected: Seqno,
        /// The position actually delivered.
        got: Seqno,
    },

    /// The replicator has been closed.
    #[error("replicator closed")]
    Closed,

    /// The group communication transport rejected an operation.
    #[error("transport: {0}")]
    Transport(String),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
