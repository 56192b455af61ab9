#![no_main]

use libfuzzer_sys::fuzz_target;
use mqtt_cluster_proxy::core::codec::{encode, parse};

fuzz_target!(|data: &[u8]| {
    // Fuzz frame parsing - test for panics, crashes, infinite loops
    if let Ok(message) = parse(data) {
        // Anything that parses must encode and parse back to itself
        if let Ok(bytes) = encode(&message) {
            assert_eq!(parse(&bytes).ok(), Some(message));
        }
    }
});
