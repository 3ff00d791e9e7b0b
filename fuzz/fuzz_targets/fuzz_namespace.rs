#![no_main]

use bakkerij::Namespace;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(ns) = s.parse::<Namespace>() {
        // A parsed namespace serializes and parses back to itself.
        let round: Namespace = ns.to_string().parse().unwrap();
        assert_eq!(round, ns);
    }
});
