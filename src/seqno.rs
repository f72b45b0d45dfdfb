use std::fmt;

/// Monotonic sequence number.
///
/// Seqnos are signed so that [`SEQNO_UNDEFINED`] sorts below every valid
/// position. Comparisons are plain arithmetic; seqnos never wrap in
/// practice.
pub type Seqno = i64;

/// The "no position" marker.
pub const SEQNO_UNDEFINED: Seqno = -1;

/// Opaque 16-byte identifier of an originating node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId([u8; 16]);

impl SourceId {
    /// The all-zero id, used before a node has joined a group.
    pub const UNDEFINED: SourceId = SourceId([0; 16]);

    /// Wraps raw id bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw id bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form, enough to tell nodes apart in logs.
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[14], self.0[15]
        )
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Global transaction identifier: a group id plus a position in its
/// sequence.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Gtid {
    /// Identifier of the group (primary component) this position belongs to.
    pub source: SourceId,
    /// Position within the group's global sequence.
    pub seqno: Seqno,
}

impl Gtid {
    /// Gtid of a node that has not joined any group.
    pub const UNDEFINED: Gtid = Gtid { source: SourceId::UNDEFINED, seqno: SEQNO_UNDEFINED };

    /// Creates a gtid from its parts.
    pub const fn new(source: SourceId, seqno: Seqno) -> Self {
        Self { source, seqno }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.seqno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_sorts_below_valid() {
        assert!(SEQNO_UNDEFINED < 0);
        let valid: Seqno = 0;
        assert!(SEQNO_UNDEFINED < valid);
    }

    #[test]
    fn source_id_display_is_stable() {
        let id = SourceId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "abababab-abab");
        assert_eq!(SourceId::UNDEFINED.to_string(), "00000000-0000");
    }

    #[test]
    fn gtid_display() {
        let gtid = Gtid::new(SourceId::UNDEFINED, 42);
        assert_eq!(gtid.to_string(), "00000000-0000:42");
    }
}
