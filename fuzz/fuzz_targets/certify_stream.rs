//! Certification over fuzz-shaped streams must stay panic-free and
//! deterministic.
#![no_main]

use libfuzzer_sys::fuzz_target;
use wsrep_core::{
    Certifier, Config, Gtid, Key, KeyAccess, KeyPart, Seqno, SourceId, TrxFlags, TrxHandle,
    TrxState,
};

fn run(data: &[u8]) -> Vec<Seqno> {
    let cert = Certifier::new(&Config::default());
    cert.assign_initial_position(Gtid::new(SourceId::from_bytes([0xee; 16]), 0));

    let mut out = Vec::new();
    for (i, chunk) in data.chunks_exact(3).take(256).enumerate() {
        let gs = i as Seqno + 1;
        let access = KeyAccess::from_byte(chunk[1] % 4).unwrap();
        let last_seen = (gs - 1).min(chunk[2] as Seqno);
        let trx = TrxHandle::new_local(
            SourceId::from_bytes([chunk[0] % 4; 16]),
            1,
            gs as u64,
            TrxFlags::BEGIN | TrxFlags::COMMIT,
            vec![KeyPart::new(Key::new([vec![chunk[0] / 4]]), access)],
            0,
        );
        {
            let mut g = trx.lock();
            g.set_state(TrxState::Replicating);
            g.set_last_seen_seqno(last_seen);
            g.assign_delivery(gs, gs);
        }
        cert.append_trx(&trx).unwrap();
        out.push(trx.depends_seqno());
        cert.set_trx_committed(&trx);
    }
    out
}

fuzz_target!(|data: &[u8]| {
    assert_eq!(run(data), run(data));
});
