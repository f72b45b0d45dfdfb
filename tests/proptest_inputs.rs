//! Property-based tests: arbitrary inputs must not panic, codec
//! round-trips must be lossless, and certification must stay
//! deterministic across independent replicas.
#![allow(missing_docs)]

mod common;

use common::{group, node};
use proptest::prelude::*;
use wsrep_core::{
    Certifier, Config, Gtid, Key, KeyAccess, KeyPart, LocalOrder, Monitor, Seqno, SourceId,
    TestResult, TrxFlags, TrxHandle, TrxState, WriteSet,
};

/// Strategy for byte vectors of various sizes (0 to 1KB).
fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..1024)
}

fn arb_access() -> impl Strategy<Value = KeyAccess> {
    prop_oneof![
        Just(KeyAccess::Shared),
        Just(KeyAccess::Reference),
        Just(KeyAccess::Update),
        Just(KeyAccess::Exclusive),
    ]
}

fn arb_key() -> impl Strategy<Value = KeyPart> {
    (prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..4), arb_access())
        .prop_map(|(parts, access)| KeyPart::new(Key::new(parts), access))
}

fn arb_writeset() -> impl Strategy<Value = WriteSet> {
    (
        any::<[u8; 16]>(),
        any::<u64>(),
        any::<u64>(),
        0..1_000_000i64,
        prop::collection::vec(arb_key(), 0..8),
        arb_bytes(),
    )
        .prop_map(|(source, conn_id, trx_id, last_seen, keys, payload)| WriteSet {
            flags: TrxFlags::BEGIN | TrxFlags::COMMIT,
            source_id: SourceId::from_bytes(source),
            conn_id,
            trx_id,
            last_seen_seqno: last_seen,
            keys,
            payload,
        })
}

/// One step of a synthetic certification stream.
#[derive(Debug, Clone)]
struct Step {
    source: u8,
    key: u8,
    access: KeyAccess,
    seen_lag: i64,
}

fn arb_stream() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (1..5u8, 0..6u8, arb_access(), 0..8i64)
            .prop_map(|(source, key, access, seen_lag)| Step { source, key, access, seen_lag }),
        1..64,
    )
}

fn certify_stream(steps: &[Step]) -> Vec<(TestResult, Seqno)> {
    let cert = Certifier::new(&Config::default());
    cert.assign_initial_position(Gtid::new(group(), 0));
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let gs = i as Seqno + 1;
            let last_seen = (gs - 1 - step.seen_lag).max(0);
            let trx = TrxHandle::new_local(
                node(step.source),
                1,
                gs as u64,
                TrxFlags::BEGIN | TrxFlags::COMMIT,
                vec![KeyPart::new(
                    Key::new([vec![step.key]]),
                    step.access,
                )],
                0,
            );
            {
                let mut g = trx.lock();
                g.set_state(TrxState::Replicating);
                g.set_last_seen_seqno(last_seen);
                g.assign_delivery(gs, gs);
            }
            let verdict = cert.append_trx(&trx).unwrap();
            (verdict, trx.depends_seqno())
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn decode_arbitrary_bytes_never_panics(data in arb_bytes()) {
        let _ = WriteSet::decode(&data);
    }

    /// A decoded write set is bit-identical to what was encoded.
    #[test]
    fn writeset_round_trip(ws in arb_writeset()) {
        let bytes = ws.encode();
        prop_assert_eq!(bytes.len(), ws.encoded_len());
        let back = WriteSet::decode(&bytes).unwrap();
        prop_assert_eq!(back.flags, ws.flags);
        prop_assert_eq!(back.source_id, ws.source_id);
        prop_assert_eq!(back.conn_id, ws.conn_id);
        prop_assert_eq!(back.trx_id, ws.trx_id);
        prop_assert_eq!(back.last_seen_seqno, ws.last_seen_seqno);
        prop_assert_eq!(back.payload, ws.payload);
        prop_assert_eq!(back.keys.len(), ws.keys.len());
        for (a, b) in back.keys.iter().zip(ws.keys.iter()) {
            prop_assert_eq!(a.access, b.access);
            prop_assert_eq!(a.key.fingerprint(), b.key.fingerprint());
        }
    }

    /// Flipping any single byte of a valid encoding either fails to
    /// decode or decodes without panicking; it never panics.
    #[test]
    fn corrupted_writeset_never_panics(ws in arb_writeset(), idx in any::<prop::sample::Index>(), bit in 0..8u8) {
        let mut bytes = ws.encode();
        let i = idx.index(bytes.len());
        bytes[i] ^= 1 << bit;
        let _ = WriteSet::decode(&bytes);
    }

    /// Two certifiers fed the same ordered stream reach identical
    /// verdicts and depends seqnos.
    #[test]
    fn certification_is_deterministic(steps in arb_stream()) {
        prop_assert_eq!(certify_stream(&steps), certify_stream(&steps));
    }

    /// Depends seqnos always point strictly below the write set itself,
    /// and failed write sets leave no index residue behind.
    #[test]
    fn depends_seqno_invariants(steps in arb_stream()) {
        for (i, (verdict, depends)) in certify_stream(&steps).iter().enumerate() {
            let gs = i as Seqno + 1;
            match verdict {
                TestResult::Ok => {
                    prop_assert!(*depends >= 0 && *depends < gs, "seqno {gs} depends {depends}");
                }
                TestResult::Failed => prop_assert_eq!(*depends, wsrep_core::SEQNO_UNDEFINED),
            }
        }
    }

    /// A committed-in-order stream can always be purged completely, and
    /// the purge is idempotent.
    #[test]
    fn purge_drains_everything(steps in arb_stream()) {
        let cert = Certifier::new(&Config::default());
        cert.assign_initial_position(Gtid::new(group(), 0));
        let n = steps.len() as Seqno;
        let mut trxs = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            let gs = i as Seqno + 1;
            let trx = TrxHandle::new_local(
                node(step.source),
                1,
                gs as u64,
                TrxFlags::BEGIN | TrxFlags::COMMIT,
                vec![KeyPart::new(Key::new([vec![step.key]]), step.access)],
                0,
            );
            {
                let mut g = trx.lock();
                g.set_state(TrxState::Replicating);
                g.set_last_seen_seqno(gs - 1);
                g.assign_delivery(gs, gs);
            }
            cert.append_trx(&trx).unwrap();
            trxs.push(trx);
        }
        for trx in &trxs {
            cert.set_trx_committed(trx);
        }
        prop_assert_eq!(cert.purge_trxs_upto(n), n);
        prop_assert!(cert.get_trx(n).is_none());
        prop_assert_eq!(cert.purge_trxs_upto(n), n);
    }

    /// In-order enter/leave with random self-cancels always drives the
    /// monitor frontier to the end of the stream.
    #[test]
    fn monitor_frontier_reaches_stream_end(cancels in prop::collection::vec(any::<bool>(), 1..128)) {
        let monitor = Monitor::<LocalOrder>::new(1 << 8);
        monitor.assign_initial_position(0);
        for (i, cancel) in cancels.iter().enumerate() {
            let item = LocalOrder::with_seqno(i as Seqno + 1);
            if *cancel {
                monitor.self_cancel(&item);
            } else {
                monitor.enter(&item).unwrap();
                monitor.leave(&item);
            }
            prop_assert_eq!(monitor.last_left(), i as Seqno + 1);
            prop_assert!(monitor.last_entered() >= monitor.last_left());
        }
        let (oooe, oool, _) = monitor.stats();
        prop_assert_eq!(oooe, 0.0);
        prop_assert_eq!(oool, 0.0);
    }
}
