//! Arbitrary bytes must never panic the write-set decoder.
#![no_main]

use libfuzzer_sys::fuzz_target;
use wsrep_core::WriteSet;

fuzz_target!(|data: &[u8]| {
    let _ = WriteSet::decode(data);
});
