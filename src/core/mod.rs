//! # Core Protocol Components
//!
//! Identifiers, wire frames, codecs and the message envelope.
//!
//! ## Components
//! - **Types**: `Pid`, `Sid`, `Secret`, `Promises`, `HandshakeFeatures`, protocol constants
//! - **Frame**: binary encoding of handshake and steady-state frames
//! - **Codec**: Tokio codecs for framing over byte streams
//! - **Message**: varint length-prefixed, optionally compressed payload envelope
//!
//! ## Wire Format
//! ```text
//! [Tag(1)] [Fixed-width little-endian fields] [Length-prefixed payload]
//! ```

pub mod codec;
pub mod frame;
pub mod message;
pub mod types;
