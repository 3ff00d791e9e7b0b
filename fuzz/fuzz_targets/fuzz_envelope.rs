#![no_main]

use bakkerij::Macaroon;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(m) = Macaroon::from_json(s) {
            // Whatever decodes must re-encode.
            let _ = m.to_json().unwrap();
            let _ = m.to_base64().unwrap();
            let _ = m.expiry_time();
        }
        if let Ok(m) = Macaroon::from_base64(s) {
            let _ = m.to_base64().unwrap();
        }
    }
});
