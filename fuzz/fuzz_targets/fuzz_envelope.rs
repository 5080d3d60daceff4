#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use mux_network::core::message::Message;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    // First byte picks the compression flag
    let compressed = data[0] & 1 == 1;
    if let Ok(message) = Message::from_envelope(Bytes::copy_from_slice(&data[1..]), compressed) {
        let _ = message.deserialize::<Vec<u8>>();
        let _ = message.deserialize::<String>();
    }
});
