//! Fuzz target for pack parsing and delta application.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sluice_git::{apply_delta, PackParser};
use sluice_storage::ObjectStore;

fuzz_target!(|data: &[u8]| {
    let store = ObjectStore::new();
    let _ = PackParser::new(data).parse(&store);

    // Split the input into a base and a delta.
    if let Some((&split, rest)) = data.split_first() {
        let split = (split as usize).min(rest.len());
        let (base, delta) = rest.split_at(split);
        let _ = apply_delta(base, delta);
    }
});
