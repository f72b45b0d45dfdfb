//! Any write set that decodes must re-encode to an equivalent value.
#![no_main]

use libfuzzer_sys::fuzz_target;
use wsrep_core::WriteSet;

fuzz_target!(|data: &[u8]| {
    if let Ok(ws) = WriteSet::decode(data) {
        let bytes = ws.encode();
        let back = WriteSet::decode(&bytes).expect("re-encoded write set must decode");
        assert_eq!(back.flags, ws.flags);
        assert_eq!(back.source_id, ws.source_id);
        assert_eq!(back.trx_id, ws.trx_id);
        assert_eq!(back.last_seen_seqno, ws.last_seen_seqno);
        assert_eq!(back.keys.len(), ws.keys.len());
        assert_eq!(back.payload, ws.payload);
    }
});
