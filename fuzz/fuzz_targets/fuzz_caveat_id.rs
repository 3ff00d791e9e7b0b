#![no_main]

use std::sync::OnceLock;

use bakkerij::KeyPair;
use bakkerij::codec::decode_caveat_id;
use libfuzzer_sys::fuzz_target;

fn key() -> &'static KeyPair {
    static KEY: OnceLock<KeyPair> = OnceLock::new();
    KEY.get_or_init(KeyPair::generate)
}

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary caveat ids must fail cleanly, never panic.
    let _ = decode_caveat_id(key(), data);
});
