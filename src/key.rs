use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Access type annotation on a write-set key, weakest to strongest.
///
/// The ordering matters: certification stores one reference slot per
/// access type and tests an incoming access against every slot it
/// conflicts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum KeyAccess {
    /// Read that tolerates concurrent reads and weak writes.
    Shared = 0,
    /// Foreign-key style reference.
    Reference = 1,
    /// Non-exclusive update.
    Update = 2,
    /// Exclusive write.
    Exclusive = 3,
}

impl KeyAccess {
    /// Number of access types; sizes the per-entry slot array.
    pub const COUNT: usize = 4;

    /// All access types, in slot order.
    pub const ALL: [KeyAccess; Self::COUNT] =
        [KeyAccess::Shared, KeyAccess::Reference, KeyAccess::Update, KeyAccess::Exclusive];

    /// Decodes a wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(KeyAccess::Shared),
            1 => Some(KeyAccess::Reference),
            2 => Some(KeyAccess::Update),
            3 => Some(KeyAccess::Exclusive),
            _ => None,
        }
    }

    /// Whether an incoming access of type `self` potentially conflicts
    /// with an existing reference of type `existing`.
    ///
    /// Compatible pairs still produce an ordering dependency; conflicting
    /// pairs are subject to the seqno/source visibility rule.
    pub fn conflicts_with(self, existing: KeyAccess) -> bool {
        use KeyAccess::*;
        match (self, existing) {
            (Shared, Exclusive) => true,
            (Reference, Update | Exclusive) => true,
            (Update, Reference | Update | Exclusive) => true,
            (Exclusive, _) => true,
            _ => false,
        }
    }
}

/// Composite key of a replicated row or object.
///
/// Parts are ordered from the broadest scope to the narrowest (e.g.
/// schema, table, row id). An empty trailing part set is legal; a key
/// with fewer parts shadows nothing — identity is over the exact part
/// sequence.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    parts: SmallVec<[Vec<u8>; 3]>,
}

/// Wire/codec version tag mixed into every fingerprint so that indexes
/// built under different key formats never alias.
const KEY_VERSION: u8 = 1;

impl Key {
    /// Builds a key from its ordered parts.
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self { parts: parts.into_iter().map(Into::into).collect() }
    }

    /// The ordered key parts.
    pub fn parts(&self) -> &[Vec<u8>] {
        &self.parts
    }

    /// Total byte length of all parts, used for purge accounting.
    pub fn byte_len(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    /// Stable 64-bit fingerprint over the version tag and part contents.
    ///
    /// The index uses fingerprint-only identity: 64-bit collisions are
    /// negligible for practical key counts, and a collision merely
    /// manifests as a spurious dependency or conflict, never as data
    /// corruption.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        KEY_VERSION.hash(&mut hasher);
        self.parts.len().hash(&mut hasher);
        for part in &self.parts {
            part.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            match std::str::from_utf8(part) {
                Ok(s) => write!(f, "{s}")?,
                Err(_) => write!(f, "{part:02x?}")?,
            }
        }
        write!(f, ")")
    }
}

/// A key annotated with its access type, as carried in a write set.
#[derive(Debug, Clone)]
pub struct KeyPart {
    /// The key itself.
    pub key: Key,
    /// How the transaction touched it.
    pub access: KeyAccess,
}

impl KeyPart {
    /// Annotates a key with an access type.
    pub fn new(key: Key, access: KeyAccess) -> Self {
        Self { key, access }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_matrix() {
        use KeyAccess::*;

        // Row = incoming, column = existing.
        let expected = [
            (Shared, [false, false, false, true]),
            (Reference, [false, false, true, true]),
            (Update, [false, true, true, true]),
            (Exclusive, [true, true, true, true]),
        ];
        for (incoming, row) in expected {
            for (existing, want) in KeyAccess::ALL.into_iter().zip(row) {
                assert_eq!(
                    incoming.conflicts_with(existing),
                    want,
                    "{incoming:?} vs {existing:?}"
                );
            }
        }
    }

    #[test]
    fn fingerprint_depends_on_part_boundaries() {
        let a = Key::new([b"ab".to_vec(), b"c".to_vec()]);
        let b = Key::new([b"a".to_vec(), b"bc".to_vec()]);
        let c = Key::new([b"ab".to_vec(), b"c".to_vec()]);

        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn access_byte_round_trip() {
        for access in KeyAccess::ALL {
            assert_eq!(KeyAccess::from_byte(access as u8), Some(access));
        }
        assert_eq!(KeyAccess::from_byte(9), None);
    }
}
