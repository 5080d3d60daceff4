//! Tokio codecs over the frame encoding.
//!
//! [`FrameCodec`] frames steady-state traffic on byte streams (TCP, the QUIC
//! control stream, in-memory duplex pipes). [`InitFrameCodec`] does the same for
//! the tagged handshake frames sent as datagrams.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::frame::{ITFrame, InitFrame, OTFrame};
use crate::error::{InitProtocolError, ParticipantError};

/// Codec turning a byte stream into [`ITFrame`]s and [`OTFrame`]s into bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = ITFrame;
    type Error = ParticipantError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match ITFrame::try_deserialize(src)? {
            Some((frame, used)) => {
                src.advance(used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<OTFrame> for FrameCodec {
    type Error = ParticipantError;

    fn encode(&mut self, item: OTFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_bytes(dst)?;
        Ok(())
    }
}

/// Codec for the tagged handshake frames. Errors are handshake errors, so a
/// malformed frame fails the connection attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitFrameCodec;

impl Decoder for InitFrameCodec {
    type Item = InitFrame;
    type Error = InitProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match InitFrame::try_deserialize(src)? {
            Some((frame, used)) => {
                src.advance(used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<InitFrame> for InitFrameCodec {
    type Error = InitProtocolError;

    fn encode(&mut self, item: InitFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_bytes(dst)?;
        Ok(())
    }
}
