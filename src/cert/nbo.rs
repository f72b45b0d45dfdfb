use crate::{
    seqno::{Seqno, SourceId},
    trx::TrxHandle,
};
use std::collections::{BTreeMap, HashMap};

/// One in-flight non-blocking operation: a total-order operation whose
/// start and end arrive as separate write sets, holding its keys
/// exclusively for the whole span.
#[derive(Debug)]
struct NboOp {
    source: SourceId,
    keys: Vec<u64>,
}

/// Tracks non-blocking operations between their start and end events.
///
/// Regular write sets conflict with any held key; the matching end event
/// (same originator, first started span holding the same keys) releases
/// the hold.
#[derive(Debug, Default)]
pub(crate) struct NboMap {
    // start seqno -> operation
    ops: BTreeMap<Seqno, NboOp>,
    // key fingerprint -> start seqno of the holding operation
    index: HashMap<u64, Seqno>,
}

impl NboMap {
    /// Number of in-flight operations.
    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether any key of `trx` is held by an in-flight operation.
    pub(crate) fn conflicts(&self, trx: &TrxHandle) -> Option<Seqno> {
        trx.keys().iter().find_map(|kp| self.index.get(&kp.key.fingerprint()).copied())
    }

    /// Registers a started operation holding its keys.
    pub(crate) fn begin(&mut self, seqno: Seqno, trx: &TrxHandle) {
        let keys: Vec<u64> = trx.keys().iter().map(|kp| kp.key.fingerprint()).collect();
        for &fp in &keys {
            self.index.insert(fp, seqno);
        }
        tracing::debug!(target: "wsrep", seqno, keys = keys.len(), "nbo started");
        self.ops.insert(seqno, NboOp { source: trx.source_id(), keys });
    }

    /// Finds and releases the operation matching an end event: the oldest
    /// operation from the same originator holding the same key set.
    /// Returns the start seqno, or `None` if nothing matches.
    pub(crate) fn end(&mut self, trx: &TrxHandle) -> Option<Seqno> {
        let mut end_keys: Vec<u64> = trx.keys().iter().map(|kp| kp.key.fingerprint()).collect();
        end_keys.sort_unstable();

        let start = self.ops.iter().find_map(|(&seqno, op)| {
            if op.source != trx.source_id() {
                return None;
            }
            let mut held = op.keys.clone();
            held.sort_unstable();
            (held == end_keys).then_some(seqno)
        })?;

        let op = self.ops.remove(&start).expect("matched nbo vanished");
        for fp in op.keys {
            // Only remove holds still owned by this span; a later start
            // over the same key supersedes it.
            if self.index.get(&fp) == Some(&start) {
                self.index.remove(&fp);
            }
        }
        tracing::debug!(target: "wsrep", start, end = trx.global_seqno(), "nbo ended");
        Some(start)
    }

    /// Drops every in-flight operation; used on primary-component change.
    pub(crate) fn clear(&mut self) {
        self.ops.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::TrxFlags;
    use crate::key::{Key, KeyAccess, KeyPart};
    use crate::trx::TrxState;

    fn nbo_trx(source: u8, gs: Seqno, keys: &[&str], flags: TrxFlags) -> TrxHandle {
        let keys = keys
            .iter()
            .map(|k| KeyPart::new(Key::new([k.as_bytes().to_vec()]), KeyAccess::Exclusive))
            .collect();
        let t = TrxHandle::new_local(SourceId::from_bytes([source; 16]), 1, gs as u64, flags, keys, 0);
        {
            let mut g = t.lock();
            g.set_state(TrxState::Replicating);
            g.set_last_seen_seqno(gs - 1);
            g.assign_delivery(gs, gs);
        }
        t
    }

    #[test]
    fn start_holds_keys_until_matching_end() {
        let mut nbo = NboMap::default();
        let start = nbo_trx(1, 5, &["t1"], TrxFlags::ISOLATION | TrxFlags::BEGIN);
        nbo.begin(5, &start);

        let regular = nbo_trx(2, 6, &["t1"], TrxFlags::BEGIN | TrxFlags::COMMIT);
        assert_eq!(nbo.conflicts(&regular), Some(5));

        let other = nbo_trx(2, 7, &["t2"], TrxFlags::BEGIN | TrxFlags::COMMIT);
        assert_eq!(nbo.conflicts(&other), None);

        let end = nbo_trx(1, 8, &["t1"], TrxFlags::ISOLATION | TrxFlags::COMMIT);
        assert_eq!(nbo.end(&end), Some(5));
        assert_eq!(nbo.len(), 0);
        assert_eq!(nbo.conflicts(&regular), None);
    }

    #[test]
    fn end_requires_same_source_and_keys() {
        let mut nbo = NboMap::default();
        let start = nbo_trx(1, 5, &["t1"], TrxFlags::ISOLATION | TrxFlags::BEGIN);
        nbo.begin(5, &start);

        let wrong_source = nbo_trx(2, 6, &["t1"], TrxFlags::ISOLATION | TrxFlags::COMMIT);
        assert_eq!(nbo.end(&wrong_source), None);

        let wrong_keys = nbo_trx(1, 7, &["t2"], TrxFlags::ISOLATION | TrxFlags::COMMIT);
        assert_eq!(nbo.end(&wrong_keys), None);
        assert_eq!(nbo.len(), 1);
    }

    #[test]
    fn oldest_matching_span_released_first() {
        let mut nbo = NboMap::default();
        let s1 = nbo_trx(1, 5, &["t1"], TrxFlags::ISOLATION | TrxFlags::BEGIN);
        let s2 = nbo_trx(1, 6, &["t1"], TrxFlags::ISOLATION | TrxFlags::BEGIN);
        nbo.begin(5, &s1);
        nbo.begin(6, &s2);

        let end = nbo_trx(1, 9, &["t1"], TrxFlags::ISOLATION | TrxFlags::COMMIT);
        assert_eq!(nbo.end(&end), Some(5));
        // The newer span still holds the key.
        let regular = nbo_trx(2, 10, &["t1"], TrxFlags::BEGIN | TrxFlags::COMMIT);
        assert_eq!(nbo.conflicts(&regular), Some(6));
    }
}
