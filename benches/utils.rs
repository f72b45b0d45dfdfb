#![allow(missing_docs, unreachable_pub, dead_code)]

use wsrep_core::{
    Certifier, Config, Gtid, Key, KeyAccess, KeyPart, Seqno, SourceId, TrxFlags, TrxHandle,
    TrxState,
};

pub fn node(n: u8) -> SourceId {
    SourceId::from_bytes([n; 16])
}

pub fn fresh_certifier() -> Certifier {
    let cert = Certifier::new(&Config::default());
    cert.assign_initial_position(Gtid::new(node(0xee), 0));
    cert
}

/// Builds a delivered transaction handle ready for certification.
pub fn delivered_trx(
    source: u8,
    global_seqno: Seqno,
    last_seen: Seqno,
    keys: &[(Vec<u8>, KeyAccess)],
) -> TrxHandle {
    let keys = keys
        .iter()
        .map(|(k, a)| KeyPart::new(Key::new([k.clone()]), *a))
        .collect();
    let trx = TrxHandle::new_local(
        node(source),
        1,
        global_seqno as u64,
        TrxFlags::BEGIN | TrxFlags::COMMIT,
        keys,
        64,
    );
    {
        let mut g = trx.lock();
        g.set_state(TrxState::Replicating);
        g.set_last_seen_seqno(last_seen);
        g.assign_delivery(global_seqno, global_seqno);
    }
    trx
}

/// A pool of `n` distinct single-part keys.
pub fn key_pool(n: u32) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("table/row-{i:08}").into_bytes()).collect()
}
