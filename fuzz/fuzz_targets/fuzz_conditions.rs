#![no_main]

use bakkerij::caveat::{parse_caveat, squash_conditions};
use bakkerij::checker::infer_declared_from_conditions;
use bakkerij::namespace::Namespace;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let _ = parse_caveat(s);

    let conditions: Vec<&str> = s.lines().collect();
    let squashed = squash_conditions(&conditions);
    // Idempotency must hold for arbitrary inputs.
    assert_eq!(squash_conditions(&squashed), squashed);

    let ns = Namespace::std();
    let _ = infer_declared_from_conditions(&ns, conditions.iter().copied());
});
