//! Payload compression for streams opened with [`Promises::COMPRESSED`].
//!
//! [`Promises::COMPRESSED`]: crate::core::types::Promises::COMPRESSED

use std::io::Read;

use crate::error::{StreamError, StreamResult};

/// Maximum output size for decompression, guards against decompression bombs.
pub const MAX_DECOMPRESSION_SIZE: usize = 16 * 1024 * 1024;

/// zstd level used for stream payloads. Favors latency over ratio.
pub const COMPRESSION_LEVEL: i32 = 1;

/// Compresses a serialized payload.
///
/// # Errors
/// Returns `StreamError::Compression` if the encoder fails
pub fn compress(data: &[u8]) -> StreamResult<Vec<u8>> {
    let mut out = Vec::new();
    zstd::stream::copy_encode(data, &mut out, COMPRESSION_LEVEL)
        .map_err(|_| StreamError::Compression)?;
    Ok(out)
}

/// Decompresses a payload produced by [`compress`].
///
/// # Errors
/// Returns `StreamError::Decompression` if the data is malformed or would
/// inflate beyond [`MAX_DECOMPRESSION_SIZE`]
pub fn decompress(data: &[u8]) -> StreamResult<Vec<u8>> {
    let mut reader = zstd::stream::Decoder::new(data).map_err(|_| StreamError::Decompression)?;

    let mut out = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                if out.len() > MAX_DECOMPRESSION_SIZE {
                    return Err(StreamError::Decompression);
                }
            }
            Err(_) => return Err(StreamError::Decompression),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_roundtrip() {
        let original = b"ping ping ping ping ping ping ping ping";
        let compressed = compress(original).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn test_malformed_input_rejected() {
        let result = decompress(&[0x28, 0xb5, 0x2f, 0xfd, 0xff, 0xff]);
        assert!(matches!(result, Err(StreamError::Decompression)));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_bomb_rejected() {
        let huge = vec![0u8; MAX_DECOMPRESSION_SIZE + 1];
        let compressed = compress(&huge).unwrap();
        assert!(matches!(
            decompress(&compressed),
            Err(StreamError::Decompression)
        ));
    }
}
