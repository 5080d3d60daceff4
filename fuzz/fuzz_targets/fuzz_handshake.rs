#![no_main]

use libfuzzer_sys::fuzz_target;
use mux_network::protocol::handshake::{handshake_bytes, parse_handshake};

fuzz_target!(|data: &[u8]| {
    let Ok(parsed) = parse_handshake(data) else {
        return;
    };
    let bytes = handshake_bytes(parsed.version, parsed.pid, parsed.secret, parsed.features);
    let again = match parse_handshake(&bytes) {
        Ok(again) => again,
        Err(e) => panic!("accepted handshake failed to re-parse: {e:?}"),
    };
    assert_eq!(again.version, parsed.version);
    assert_eq!(again.pid, parsed.pid);
    assert_eq!(again.secret, parsed.secret);
    assert_eq!(again.features, parsed.features);
});
