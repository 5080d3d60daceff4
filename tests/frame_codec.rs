//! Frame codec and message envelope properties

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use mux_network::core::codec::FrameCodec;
use mux_network::core::frame::{ITFrame, OTFrame, TAG_DATA, TAG_OPEN_STREAM};
use mux_network::core::message::Message;
use mux_network::core::types::{Promises, Sid, StreamParams};
use mux_network::error::FrameError;
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn ot_frame() -> impl Strategy<Value = OTFrame> {
    prop_oneof![
        Just(OTFrame::Shutdown),
        (any::<u64>(), 0u8..8, 0u8..32, any::<u64>()).prop_map(|(sid, prio, promises, bw)| {
            OTFrame::OpenStream {
                sid: Sid::new(sid),
                prio,
                promises: Promises::from_bits_truncate(promises),
                guaranteed_bandwidth: bw,
            }
        }),
        any::<u64>().prop_map(|sid| OTFrame::CloseStream { sid: Sid::new(sid) }),
        (any::<u64>(), any::<u64>(), any::<u64>()).prop_map(|(mid, sid, length)| {
            OTFrame::DataHeader {
                mid,
                sid: Sid::new(sid),
                length,
            }
        }),
        (any::<u64>(), prop::collection::vec(any::<u8>(), 0..2048)).prop_map(|(mid, data)| {
            OTFrame::Data {
                mid,
                data: Bytes::from(data),
            }
        }),
    ]
}

proptest! {
    #[test]
    fn prop_frame_roundtrip_consumes_exact_length(frame in ot_frame()) {
        let bytes = frame.to_bytes().unwrap();
        prop_assert_eq!(bytes.len(), frame.encoded_len());

        let (decoded, consumed) = ITFrame::try_deserialize(&bytes).unwrap().unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(decoded, ITFrame::from(frame));
    }

    #[test]
    fn prop_truncated_frame_needs_more_data(frame in ot_frame(), cut in 0usize..64) {
        let bytes = frame.to_bytes().unwrap();
        let cut = cut.min(bytes.len().saturating_sub(1));
        prop_assert!(ITFrame::try_deserialize(&bytes[..cut]).unwrap().is_none());
    }

    #[test]
    fn prop_envelope_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        compressed in any::<bool>(),
    ) {
        let promises = if compressed { Promises::COMPRESSED } else { Promises::empty() };
        let params = StreamParams::new(promises);
        let message = Message::serialize(&payload, &params).unwrap();
        prop_assert!(message.verify(&params));

        let received = Message::from_envelope(message.to_envelope(), compressed).unwrap();
        let decoded: Vec<u8> = received.deserialize().unwrap();
        prop_assert_eq!(decoded, payload);
    }
}

#[test]
fn test_open_stream_scenario() {
    let frame = OTFrame::OpenStream {
        sid: Sid::new(42),
        prio: 3,
        promises: Promises::GUARANTEED_DELIVERY,
        guaranteed_bandwidth: 10,
    };
    let bytes = frame.to_bytes().unwrap();
    assert_eq!(bytes[0], TAG_OPEN_STREAM);
    assert_eq!(bytes.len(), 1 + 8 + 1 + 1 + 8);

    let (decoded, consumed) = ITFrame::try_deserialize(&bytes).unwrap().unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(
        decoded,
        ITFrame::OpenStream {
            sid: Sid::new(42),
            prio: 3,
            promises: Promises::GUARANTEED_DELIVERY,
            guaranteed_bandwidth: 10,
        }
    );
}

#[test]
fn test_data_frame_layout_is_little_endian() {
    let frame = OTFrame::Data {
        mid: 1,
        data: Bytes::from_static(b"abc"),
    };
    let bytes = frame.to_bytes().unwrap();
    assert_eq!(bytes[0], TAG_DATA);
    assert_eq!(&bytes[1..9], &1u64.to_le_bytes());
    assert_eq!(&bytes[9..11], &3u16.to_le_bytes());
    assert_eq!(&bytes[11..], b"abc");
}

#[test]
fn test_unknown_tag_carries_raw_bytes() {
    let err = ITFrame::try_deserialize(&[0xee, 1, 2]).unwrap_err();
    match err {
        FrameError::UnknownTag { tag, raw } => {
            assert_eq!(tag, 0xee);
            assert_eq!(raw, vec![0xee, 1, 2]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_codec_splits_a_byte_stream() {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    codec.encode(OTFrame::CloseStream { sid: Sid::new(7) }, &mut buf).unwrap();
    codec.encode(OTFrame::Shutdown, &mut buf).unwrap();

    let mut partial = buf.split_to(4);
    assert!(codec.decode(&mut partial).unwrap().is_none());
    partial.unsplit(buf);

    assert_eq!(
        codec.decode(&mut partial).unwrap(),
        Some(ITFrame::CloseStream { sid: Sid::new(7) })
    );
    assert_eq!(codec.decode(&mut partial).unwrap(), Some(ITFrame::Shutdown));
    assert!(codec.decode(&mut partial).unwrap().is_none());
}
