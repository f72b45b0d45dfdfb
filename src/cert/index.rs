use crate::{
    key::KeyAccess,
    seqno::{Seqno, SourceId},
    trx::{TrxGuard, TrxHandle},
};
use std::collections::HashMap;

/// A by-value weak reference to the most recent transaction that touched
/// a key at one access type.
///
/// Certification only ever needs the referenced transaction's position
/// and origin, so the slot stores those directly instead of pointing at
/// the handle. The handle can be dropped freely; a stale slot is cleared
/// by purge when its seqno falls below the discard horizon.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotRef {
    pub(crate) seqno: Seqno,
    pub(crate) source: SourceId,
}

/// Per-key record: one slot per access type.
#[derive(Debug, Default)]
pub(crate) struct KeyEntry {
    slots: [Option<SlotRef>; KeyAccess::COUNT],
}

impl KeyEntry {
    fn slot(&self, access: KeyAccess) -> Option<SlotRef> {
        self.slots[access as usize]
    }

    fn set(&mut self, access: KeyAccess, slot: SlotRef) {
        if let Some(prev) = self.slots[access as usize] {
            debug_assert!(
                prev.seqno <= slot.seqno,
                "slot seqno regression {} -> {}",
                prev.seqno,
                slot.seqno
            );
        }
        self.slots[access as usize] = Some(slot);
    }

    fn clear_if(&mut self, access: KeyAccess, seqno: Seqno) {
        if self.slots[access as usize].is_some_and(|s| s.seqno == seqno) {
            self.slots[access as usize] = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Outcome of the per-trx conflict test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    /// Admitted; the computed depends seqno is on the handle.
    Ok,
    /// Conflicted with an unseen concurrent write set.
    Failed,
}

/// Map from key fingerprint to the most recent referencing transactions.
///
/// Identity is fingerprint-only: 64-bit collisions are negligible at
/// practical index sizes, and a collision can only manufacture a spurious
/// dependency or conflict, never corruption. Externally locked by the
/// certifier.
#[derive(Debug, Default)]
pub(crate) struct KeyIndex {
    map: HashMap<u64, KeyEntry>,
}

impl KeyIndex {
    /// Number of live key entries.
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Runs the conflict test for `trx` against the index and, if it
    /// passes, stores the trx as the new reference for each of its keys.
    ///
    /// `depends_floor` seeds the dependency computation (initial position
    /// or the last parallel-apply-unsafe seqno). On success the computed
    /// depends seqno is written to the handle and back references are
    /// recorded in `cert_keys`; on failure any references inserted for
    /// this trx are rolled back and the handle is left untouched.
    pub(crate) fn test_and_ref(
        &mut self,
        trx: &TrxHandle,
        g: &mut TrxGuard<'_>,
        depends_floor: Seqno,
        log_conflicts: bool,
    ) -> TestResult {
        let own_seqno = g.global_seqno();
        let last_seen = g.last_seen_seqno();
        let source = trx.source_id();
        let mut depends = depends_floor;

        debug_assert!(g.cert_keys().is_empty());

        for kp in trx.keys() {
            let fp = kp.key.fingerprint();
            let entry = self.map.entry(fp).or_default();

            for existing in KeyAccess::ALL {
                let Some(slot) = entry.slot(existing) else { continue };
                // A trx never conflicts with (or depends on) its own
                // earlier reference to the same key.
                if slot.seqno == own_seqno {
                    continue;
                }

                if kp.access.conflicts_with(existing) {
                    // The reference conflicts unless the originator had
                    // seen it committed, or it is the originator's own
                    // write at the same strength.
                    let asymmetric = kp.access != existing;
                    if slot.seqno > last_seen && (slot.source != source || asymmetric) {
                        if log_conflicts {
                            tracing::info!(
                                target: "wsrep",
                                seqno = own_seqno,
                                conflict_seqno = slot.seqno,
                                last_seen,
                                key = ?kp.key,
                                access = ?kp.access,
                                existing = ?existing,
                                "certification conflict"
                            );
                        }
                        self.rollback_refs(g);
                        return TestResult::Failed;
                    }
                }
                // Compatible or visible: ordering dependency only.
                depends = depends.max(slot.seqno);
            }

            entry.set(kp.access, SlotRef { seqno: own_seqno, source });
            g.push_cert_key(fp, kp.access);
        }

        g.set_depends_seqno(depends.min(own_seqno - 1));
        TestResult::Ok
    }

    /// References every key of a total-order write set exclusively,
    /// bypassing the conflict test.
    pub(crate) fn ref_all_exclusive(&mut self, trx: &TrxHandle, g: &mut TrxGuard<'_>) {
        let slot = SlotRef { seqno: g.global_seqno(), source: trx.source_id() };
        for kp in trx.keys() {
            let fp = kp.key.fingerprint();
            self.map.entry(fp).or_default().set(KeyAccess::Exclusive, slot);
            g.push_cert_key(fp, KeyAccess::Exclusive);
        }
    }

    /// Clears every slot still referencing `trx` and drops entries that
    /// become empty. Idempotent.
    pub(crate) fn purge(&mut self, g: &mut TrxGuard<'_>) {
        let seqno = g.global_seqno();
        for &(fp, access) in g.cert_keys() {
            if let Some(entry) = self.map.get_mut(&fp) {
                entry.clear_if(access, seqno);
                if entry.is_empty() {
                    self.map.remove(&fp);
                }
            }
        }
        g.clear_cert_keys();
    }

    /// Drops every entry; used on primary-component change.
    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }

    /// Whether any slot references the given seqno (test support).
    #[cfg(test)]
    pub(crate) fn references_seqno(&self, seqno: Seqno) -> bool {
        self.map
            .values()
            .any(|e| e.slots.iter().any(|s| s.is_some_and(|s| s.seqno == seqno)))
    }

    // Undoes references inserted for a trx whose test failed part-way.
    fn rollback_refs(&mut self, g: &mut TrxGuard<'_>) {
        let seqno = g.global_seqno();
        for &(fp, access) in g.cert_keys() {
            if let Some(entry) = self.map.get_mut(&fp) {
                entry.clear_if(access, seqno);
                if entry.is_empty() {
                    self.map.remove(&fp);
                }
            }
        }
        g.clear_cert_keys();
    }
}
