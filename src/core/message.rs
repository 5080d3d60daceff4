//! Message envelope.
//!
//! A message is an opaque payload: a base-128 varint holding the payload length,
//! followed by the `bincode` encoding of the sent value, zstd-compressed when the
//! stream was opened with [`Promises::COMPRESSED`]. A message carries no identity
//! of its own; the frame around it names the stream.

use bytes::{BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;
use serde::{de::DeserializeOwned, Serialize};

use crate::core::types::{Promises, StreamParams};
use crate::error::{constants, StreamError, StreamResult};
use crate::utils::compression;

/// Serialized payload, ready to be handed to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    compressed: bool,
}

impl Message {
    /// Serialize `value` the way a stream opened with `params` expects it.
    pub fn serialize<T: Serialize + ?Sized>(
        value: &T,
        params: &StreamParams,
    ) -> StreamResult<Self> {
        let encoded = bincode::serialize(value).map_err(StreamError::Serialize)?;
        let compressed = params.promises.contains(Promises::COMPRESSED);
        let payload = if compressed {
            compression::compress(&encoded)?
        } else {
            encoded
        };
        Ok(Self {
            payload: Bytes::from(payload),
            compressed,
        })
    }

    /// Decode the payload back into a value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> StreamResult<T> {
        if self.compressed {
            let raw = compression::decompress(&self.payload)?;
            bincode::deserialize(&raw).map_err(StreamError::Deserialize)
        } else {
            bincode::deserialize(&self.payload).map_err(StreamError::Deserialize)
        }
    }

    /// Wrap already encoded payload bytes.
    pub fn from_payload(payload: Bytes, compressed: bool) -> Self {
        Self {
            payload,
            compressed,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Checks that the message was built for a stream with these parameters.
    ///
    /// Sending a message serialized for a compressed stream over an
    /// uncompressed one (or vice versa) would make the receiver fail to decode it.
    pub fn verify(&self, params: &StreamParams) -> bool {
        self.compressed == params.promises.contains(Promises::COMPRESSED)
    }

    /// Envelope bytes: `varint(len) || payload`.
    pub fn to_envelope(&self) -> Bytes {
        let len = self.payload.len() as u64;
        let mut buf = BytesMut::with_capacity(len.required_space() + self.payload.len());
        let mut prefix = [0u8; 10];
        let used = len.encode_var(&mut prefix);
        buf.put_slice(&prefix[..used]);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse envelope bytes received on a stream with the given compression flag.
    pub fn from_envelope(envelope: Bytes, compressed: bool) -> StreamResult<Self> {
        let (len, used) = u64::decode_var(&envelope)
            .ok_or(StreamError::InvalidEnvelope(constants::ERR_ENVELOPE_PREFIX))?;
        let rest = envelope.len() - used;
        if len != rest as u64 {
            return Err(StreamError::InvalidEnvelope(constants::ERR_ENVELOPE_LENGTH));
        }
        Ok(Self {
            payload: envelope.slice(used..),
            compressed,
        })
    }
}
