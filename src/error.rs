//! # Error Types
//!
//! Error handling for the multiplexed transport.
//!
//! Errors are split by the layer that raises them so callers can tell a broken
//! connection attempt from a failed send on one stream:
//!
//! ## Error Categories
//! - **Frame errors**: malformed wire frames, carrying the offending bytes
//! - **Handshake errors**: wrong magic number, unsupported version, missing confirmation
//! - **Connect errors**: I/O failures while dialing or accepting, handshake failures
//! - **Network errors**: listen failures, closed network, unknown participants
//! - **Stream errors**: closed streams, oversized messages, (de)compression and
//!   (de)serialization failures
//! - **Participant errors**: disconnected participants, broken transports
//!
//! ## Example Usage
//! ```rust
//! use mux_network::error::{StreamError, StreamResult};
//!
//! fn check(closed: bool) -> StreamResult<()> {
//!     if closed {
//!         return Err(StreamError::StreamClosed);
//!     }
//!     Ok(())
//! }
//!
//! assert!(check(true).is_err());
//! ```

use std::io;
use thiserror::Error;

use crate::core::types::Pid;

/// Reasons carried by [`StreamError::InvalidEnvelope`].
pub mod constants {
    pub const ERR_ENVELOPE_LENGTH: &str = "Envelope length prefix does not match payload";
    pub const ERR_ENVELOPE_PREFIX: &str = "Envelope length prefix is missing or truncated";
    pub const ERR_RELIABLE_HEADER: &str = "Reliable control header truncated";
    pub const ERR_RELIABLE_KIND: &str = "Unknown reliable control kind";
}

/// A wire frame could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame tag {tag:#04x} (raw: {raw:02x?})")]
    UnknownTag { tag: u8, raw: Vec<u8> },

    #[error("frame field `{field}` is invalid (raw: {raw:02x?})")]
    InvalidField { field: &'static str, raw: Vec<u8> },

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
}

/// Failures of the handshake state machine. Always fatal to the connection attempt.
#[derive(Error, Debug)]
pub enum InitProtocolError {
    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed before the handshake completed")]
    NotHandshake,

    #[error("wrong magic number: {0:02x?}")]
    WrongMagicNumber([u8; 7]),

    #[error("unsupported network version {0:?}")]
    WrongVersion([u32; 3]),

    #[error("handshake confirmation missing")]
    MissingConfirmation,

    #[error("handshake confirmation byte {0:#04x} is invalid")]
    WrongConfirmation(u8),

    #[error("unexpected init frame: expected {expected}")]
    UnexpectedFrame { expected: &'static str },

    #[error("malformed init frame: {0}")]
    Frame(#[from] FrameError),
}

/// Failures while establishing a connection to (or from) a remote peer.
#[derive(Error, Debug)]
pub enum NetworkConnectError {
    #[error("I/O error while connecting: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] InitProtocolError),

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error("connection attempt timed out")]
    Timeout,

    #[error("remote secret does not match the registered participant")]
    InvalidSecret,

    #[error("participant {0} is already connected")]
    AlreadyConnected(Pid),

    #[error("QUIC error: {0}")]
    Quic(String),
}

/// Errors returned by [`crate::network::Network`] operations.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("network has been shut down")]
    NetworkClosed,

    #[error("failed to listen: {0}")]
    ListenFailed(#[source] io::Error),

    #[error("failed to connect: {0}")]
    ConnectFailed(#[from] NetworkConnectError),

    #[error("no participant with pid {0}")]
    UnknownParticipant(Pid),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors reported to the caller of one send or receive on a stream.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream closed")]
    StreamClosed,

    #[error("payload compression failed")]
    Compression,

    #[error("payload decompression failed")]
    Decompression,

    #[error("payload serialization failed: {0}")]
    Serialize(#[source] bincode::Error),

    #[error("payload deserialization failed: {0}")]
    Deserialize(#[source] bincode::Error),

    #[error("invalid message envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },
}

/// Participant-wide failures.
#[derive(Error, Debug)]
pub enum ParticipantError {
    #[error("participant disconnected")]
    ParticipantDisconnected,

    #[error("transport failed: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
}

/// Result alias for network-level operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Result alias for stream operations
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Result alias for participant operations
pub type ParticipantResult<T> = std::result::Result<T, ParticipantError>;

impl From<ParticipantError> for StreamError {
    fn from(_: ParticipantError) -> Self {
        StreamError::StreamClosed
    }
}
