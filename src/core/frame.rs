//! # Frame Codec
//!
//! Stateless binary encoding of the frames exchanged between two participants.
//!
//! Every frame starts with a one byte tag, numeric fields are fixed-width
//! little-endian and variable payloads carry a length prefix (16 bit for
//! [`OTFrame::Data`], 64 bit for [`InitFrame::Raw`]).
//!
//! ## Tags
//! ```text
//! Init family:      Handshake=1  Init=2  Raw=8
//! Steady state:     Shutdown=3  OpenStream=4  CloseStream=5  DataHeader=6  Data=7
//! ```
//!
//! Decoding never consumes more than it is given: a truncated buffer yields
//! `Ok(None)` ("needs more data"), a malformed one a [`FrameError`] carrying the
//! offending bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::types::{HandshakeFeatures, Mid, Pid, Prio, Promises, Secret, Sid, LOWEST_PRIO};
use crate::error::FrameError;

pub const TAG_HANDSHAKE: u8 = 1;
pub const TAG_INIT: u8 = 2;
pub const TAG_SHUTDOWN: u8 = 3;
pub const TAG_OPEN_STREAM: u8 = 4;
pub const TAG_CLOSE_STREAM: u8 = 5;
pub const TAG_DATA_HEADER: u8 = 6;
pub const TAG_DATA: u8 = 7;
pub const TAG_RAW: u8 = 8;

/// Largest payload a single [`OTFrame::Data`] can carry.
pub const MAX_DATA_PAYLOAD: usize = u16::MAX as usize;

/// Upper bound for [`InitFrame::Raw`] payloads; they only ever carry a confirmation byte.
pub const MAX_RAW_PAYLOAD: usize = 64 * 1024;

const HANDSHAKE_BODY: usize = 7 + 3 * 4;
const INIT_BODY: usize = 16 + 16 + 4;
const OPEN_STREAM_BODY: usize = 8 + 1 + 1 + 8;
const DATA_HEADER_BODY: usize = 8 + 8 + 8;

/// Frames only valid while the handshake is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitFrame {
    Handshake {
        magic_number: [u8; 7],
        version: [u32; 3],
    },
    Init {
        pid: Pid,
        secret: Secret,
        features: HandshakeFeatures,
    },
    Raw(Vec<u8>),
}

/// Outgoing steady-state frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OTFrame {
    Shutdown,
    OpenStream {
        sid: Sid,
        prio: Prio,
        promises: Promises,
        guaranteed_bandwidth: u64,
    },
    CloseStream {
        sid: Sid,
    },
    DataHeader {
        mid: Mid,
        sid: Sid,
        length: u64,
    },
    Data {
        mid: Mid,
        data: Bytes,
    },
}

/// Incoming steady-state frame. Same layout as [`OTFrame`], kept apart so the
/// direction of a frame is visible in every signature that handles one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ITFrame {
    Shutdown,
    OpenStream {
        sid: Sid,
        prio: Prio,
        promises: Promises,
        guaranteed_bandwidth: u64,
    },
    CloseStream {
        sid: Sid,
    },
    DataHeader {
        mid: Mid,
        sid: Sid,
        length: u64,
    },
    Data {
        mid: Mid,
        data: Bytes,
    },
}

impl From<OTFrame> for ITFrame {
    fn from(frame: OTFrame) -> Self {
        match frame {
            OTFrame::Shutdown => ITFrame::Shutdown,
            OTFrame::OpenStream {
                sid,
                prio,
                promises,
                guaranteed_bandwidth,
            } => ITFrame::OpenStream {
                sid,
                prio,
                promises,
                guaranteed_bandwidth,
            },
            OTFrame::CloseStream { sid } => ITFrame::CloseStream { sid },
            OTFrame::DataHeader { mid, sid, length } => ITFrame::DataHeader { mid, sid, length },
            OTFrame::Data { mid, data } => ITFrame::Data { mid, data },
        }
    }
}

impl InitFrame {
    /// Exact number of bytes [`InitFrame::write_bytes`] produces.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            InitFrame::Handshake { .. } => HANDSHAKE_BODY,
            InitFrame::Init { .. } => INIT_BODY,
            InitFrame::Raw(data) => 8 + data.len(),
        }
    }

    pub fn write_bytes(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        buf.reserve(self.encoded_len());
        match self {
            InitFrame::Handshake {
                magic_number,
                version,
            } => {
                buf.put_u8(TAG_HANDSHAKE);
                buf.put_slice(magic_number);
                for part in version {
                    buf.put_u32_le(*part);
                }
            }
            InitFrame::Init {
                pid,
                secret,
                features,
            } => {
                buf.put_u8(TAG_INIT);
                buf.put_slice(&pid.to_bytes());
                buf.put_slice(&secret.to_bytes());
                buf.put_u32_le(features.bits());
            }
            InitFrame::Raw(data) => {
                if data.len() > MAX_RAW_PAYLOAD {
                    return Err(FrameError::Oversized {
                        len: data.len(),
                        max: MAX_RAW_PAYLOAD,
                    });
                }
                buf.put_u8(TAG_RAW);
                buf.put_u64_le(data.len() as u64);
                buf.put_slice(data);
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_bytes(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `bytes`, returning it together with
    /// the number of bytes it occupied.
    pub fn try_deserialize(bytes: &[u8]) -> Result<Option<(InitFrame, usize)>, FrameError> {
        let Some(&tag) = bytes.first() else {
            return Ok(None);
        };
        let mut body = &bytes[1..];
        match tag {
            TAG_HANDSHAKE => {
                if body.len() < HANDSHAKE_BODY {
                    return Ok(None);
                }
                let mut magic_number = [0u8; 7];
                body.copy_to_slice(&mut magic_number);
                let version = [body.get_u32_le(), body.get_u32_le(), body.get_u32_le()];
                Ok(Some((
                    InitFrame::Handshake {
                        magic_number,
                        version,
                    },
                    1 + HANDSHAKE_BODY,
                )))
            }
            TAG_INIT => {
                if body.len() < INIT_BODY {
                    return Ok(None);
                }
                let mut pid = [0u8; 16];
                body.copy_to_slice(&mut pid);
                let mut secret = [0u8; 16];
                body.copy_to_slice(&mut secret);
                // unknown feature bits from newer peers are simply not negotiated
                let features = HandshakeFeatures::from_bits_truncate(body.get_u32_le());
                Ok(Some((
                    InitFrame::Init {
                        pid: Pid::from_bytes(pid),
                        secret: Secret::from_bytes(secret),
                        features,
                    },
                    1 + INIT_BODY,
                )))
            }
            TAG_RAW => {
                if body.len() < 8 {
                    return Ok(None);
                }
                let len = body.get_u64_le();
                if len > MAX_RAW_PAYLOAD as u64 {
                    return Err(FrameError::Oversized {
                        len: usize::try_from(len).unwrap_or(usize::MAX),
                        max: MAX_RAW_PAYLOAD,
                    });
                }
                let len = len as usize;
                if body.len() < len {
                    return Ok(None);
                }
                Ok(Some((InitFrame::Raw(body[..len].to_vec()), 1 + 8 + len)))
            }
            _ => Err(FrameError::UnknownTag {
                tag,
                raw: bytes[..bytes.len().min(32)].to_vec(),
            }),
        }
    }
}

impl OTFrame {
    /// Exact number of bytes [`OTFrame::write_bytes`] produces.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            OTFrame::Shutdown => 0,
            OTFrame::OpenStream { .. } => OPEN_STREAM_BODY,
            OTFrame::CloseStream { .. } => 8,
            OTFrame::DataHeader { .. } => DATA_HEADER_BODY,
            OTFrame::Data { data, .. } => 8 + 2 + data.len(),
        }
    }

    pub fn write_bytes(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        buf.reserve(self.encoded_len());
        match self {
            OTFrame::Shutdown => buf.put_u8(TAG_SHUTDOWN),
            OTFrame::OpenStream {
                sid,
                prio,
                promises,
                guaranteed_bandwidth,
            } => {
                buf.put_u8(TAG_OPEN_STREAM);
                buf.put_u64_le(sid.value());
                buf.put_u8(*prio);
                buf.put_u8(promises.bits());
                buf.put_u64_le(*guaranteed_bandwidth);
            }
            OTFrame::CloseStream { sid } => {
                buf.put_u8(TAG_CLOSE_STREAM);
                buf.put_u64_le(sid.value());
            }
            OTFrame::DataHeader { mid, sid, length } => {
                buf.put_u8(TAG_DATA_HEADER);
                buf.put_u64_le(*mid);
                buf.put_u64_le(sid.value());
                buf.put_u64_le(*length);
            }
            OTFrame::Data { mid, data } => {
                if data.len() > MAX_DATA_PAYLOAD {
                    return Err(FrameError::Oversized {
                        len: data.len(),
                        max: MAX_DATA_PAYLOAD,
                    });
                }
                buf.put_u8(TAG_DATA);
                buf.put_u64_le(*mid);
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_bytes(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl ITFrame {
    /// Decode one frame from the front of `bytes`, returning it together with
    /// the number of bytes it occupied.
    pub fn try_deserialize(bytes: &[u8]) -> Result<Option<(ITFrame, usize)>, FrameError> {
        let Some(&tag) = bytes.first() else {
            return Ok(None);
        };
        let mut body = &bytes[1..];
        let frame = match tag {
            TAG_SHUTDOWN => (ITFrame::Shutdown, 1),
            TAG_OPEN_STREAM => {
                if body.len() < OPEN_STREAM_BODY {
                    return Ok(None);
                }
                let raw = bytes[..1 + OPEN_STREAM_BODY].to_vec();
                let sid = Sid::new(body.get_u64_le());
                let prio = body.get_u8();
                if prio > LOWEST_PRIO {
                    return Err(FrameError::InvalidField { field: "prio", raw });
                }
                let promises = Promises::from_bits(body.get_u8())
                    .ok_or(FrameError::InvalidField {
                        field: "promises",
                        raw,
                    })?;
                let guaranteed_bandwidth = body.get_u64_le();
                (
                    ITFrame::OpenStream {
                        sid,
                        prio,
                        promises,
                        guaranteed_bandwidth,
                    },
                    1 + OPEN_STREAM_BODY,
                )
            }
            TAG_CLOSE_STREAM => {
                if body.len() < 8 {
                    return Ok(None);
                }
                (
                    ITFrame::CloseStream {
                        sid: Sid::new(body.get_u64_le()),
                    },
                    1 + 8,
                )
            }
            TAG_DATA_HEADER => {
                if body.len() < DATA_HEADER_BODY {
                    return Ok(None);
                }
                let mid = body.get_u64_le();
                let sid = Sid::new(body.get_u64_le());
                let length = body.get_u64_le();
                (ITFrame::DataHeader { mid, sid, length }, 1 + DATA_HEADER_BODY)
            }
            TAG_DATA => {
                if body.len() < 8 + 2 {
                    return Ok(None);
                }
                let mid = body.get_u64_le();
                let len = body.get_u16_le() as usize;
                if body.len() < len {
                    return Ok(None);
                }
                let data = Bytes::copy_from_slice(&body[..len]);
                (ITFrame::Data { mid, data }, 1 + 8 + 2 + len)
            }
            _ => {
                return Err(FrameError::UnknownTag {
                    tag,
                    raw: bytes[..bytes.len().min(32)].to_vec(),
                })
            }
        };
        Ok(Some(frame))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::types::{VELOREN_MAGIC_NUMBER, VELOREN_NETWORK_VERSION};

    #[test]
    fn test_open_stream_exact_size() {
        let frame = OTFrame::OpenStream {
            sid: Sid::new(42),
            prio: 3,
            promises: Promises::GUARANTEED_DELIVERY,
            guaranteed_bandwidth: 10,
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes.len(), 19);
        assert_eq!(bytes[0], TAG_OPEN_STREAM);

        let (decoded, used) = ITFrame::try_deserialize(&bytes).unwrap().unwrap();
        assert_eq!(used, 19);
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
    fn test_partial_buffer_needs_more_data() {
        let frame = OTFrame::Data {
            mid: 7,
            data: Bytes::from_static(b"hello world"),
        };
        let bytes = frame.to_bytes().unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(ITFrame::try_deserialize(&bytes[..cut]).unwrap(), None);
        }
        assert!(ITFrame::try_deserialize(&bytes).unwrap().is_some());
    }

    #[test]
    fn test_trailing_bytes_are_not_consumed() {
        let mut buf = BytesMut::new();
        OTFrame::CloseStream { sid: Sid::new(9) }
            .write_bytes(&mut buf)
            .unwrap();
        OTFrame::Shutdown.write_bytes(&mut buf).unwrap();

        let (first, used) = ITFrame::try_deserialize(&buf).unwrap().unwrap();
        assert_eq!(first, ITFrame::CloseStream { sid: Sid::new(9) });
        assert_eq!(used, 9);
        let (second, used2) = ITFrame::try_deserialize(&buf[used..]).unwrap().unwrap();
        assert_eq!(second, ITFrame::Shutdown);
        assert_eq!(used2, 1);
    }

    #[test]
    fn test_unknown_tag_carries_raw_bytes() {
        let err = ITFrame::try_deserialize(&[0xEE, 1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            FrameError::UnknownTag {
                tag: 0xEE,
                raw: vec![0xEE, 1, 2, 3]
            }
        );
        // init tags are not valid in steady state
        assert!(ITFrame::try_deserialize(&[TAG_HANDSHAKE]).is_err());
    }

    #[test]
    fn test_invalid_prio_rejected() {
        let mut bytes = OTFrame::OpenStream {
            sid: Sid::new(1),
            prio: 0,
            promises: Promises::empty(),
            guaranteed_bandwidth: 0,
        }
        .to_bytes()
        .unwrap()
        .to_vec();
        bytes[9] = 200;
        match ITFrame::try_deserialize(&bytes) {
            Err(FrameError::InvalidField { field, raw }) => {
                assert_eq!(field, "prio");
                assert_eq!(raw, bytes);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_oversized_data_rejected() {
        let frame = OTFrame::Data {
            mid: 1,
            data: Bytes::from(vec![0u8; MAX_DATA_PAYLOAD + 1]),
        };
        assert!(matches!(
            frame.to_bytes(),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn test_init_frames_roundtrip() {
        let frames = [
            InitFrame::Handshake {
                magic_number: VELOREN_MAGIC_NUMBER,
                version: VELOREN_NETWORK_VERSION,
            },
            InitFrame::Init {
                pid: Pid::fake(0xdead_beef),
                secret: Secret::from_bytes([7; 16]),
                features: HandshakeFeatures::COMPRESSION,
            },
            InitFrame::Raw(vec![1]),
        ];
        for frame in frames {
            let bytes = frame.to_bytes().unwrap();
            let (decoded, used) = InitFrame::try_deserialize(&bytes).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(used, bytes.len());
            assert_eq!(used, frame.encoded_len());
        }
    }
}
