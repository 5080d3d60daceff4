#![no_main]

use libfuzzer_sys::fuzz_target;
use mux_network::core::frame::{ITFrame, OTFrame};

fn outgoing(frame: &ITFrame) -> OTFrame {
    match frame.clone() {
        ITFrame::Shutdown => OTFrame::Shutdown,
        ITFrame::OpenStream {
            sid,
            prio,
            promises,
            guaranteed_bandwidth,
        } => OTFrame::OpenStream {
            sid,
            prio,
            promises,
            guaranteed_bandwidth,
        },
        ITFrame::CloseStream { sid } => OTFrame::CloseStream { sid },
        ITFrame::DataHeader { mid, sid, length } => OTFrame::DataHeader { mid, sid, length },
        ITFrame::Data { mid, data } => OTFrame::Data { mid, data },
    }
}

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((frame, used))) = ITFrame::try_deserialize(data) {
        assert!(used <= data.len());
        // Whatever decodes must survive another trip through the encoder
        if let Ok(bytes) = outgoing(&frame).to_bytes() {
            let (again, consumed) = ITFrame::try_deserialize(&bytes)
                .ok()
                .flatten()
                .unwrap_or_else(|| panic!("re-encoded frame failed to decode: {frame:?}"));
            assert_eq!(consumed, bytes.len());
            assert_eq!(again, frame);
        }
    }
});
