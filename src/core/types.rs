//! Identifiers, flag sets and protocol constants shared by every layer.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic bytes opening every handshake.
pub const VELOREN_MAGIC_NUMBER: [u8; 7] = *b"VELOREN";

/// Locally supported network version `[major, minor, patch]`.
pub const VELOREN_NETWORK_VERSION: [u32; 3] = [0, 6, 0];

/// First Sid handed out by the handshake initiator.
pub const STREAM_ID_OFFSET1: Sid = Sid::new(0);

/// First Sid handed out by the handshake acceptor.
pub const STREAM_ID_OFFSET2: Sid = Sid::new(u64::MAX / 2);

/// Number of priority buckets.
pub const PRIO_BUCKETS: usize = 8;

/// Highest priority.
pub const HIGHEST_PRIO: Prio = 0;

/// Lowest priority.
pub const LOWEST_PRIO: Prio = (PRIO_BUCKETS - 1) as Prio;

/// Stream / message priority, 0 is served first.
pub type Prio = u8;

/// Message id, allocated per participant for wire frames and per stream for reliable envelopes.
pub type Mid = u64;

/// Channel id.
pub type Cid = u64;

/// Bandwidth in bytes per second.
pub type Bandwidth = u64;

/// Participant identifier, 128 bits, generated by the dialing side.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(u128);

impl Pid {
    /// Generate a fresh random pid.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Deterministic pid, for tests and fixtures.
    pub const fn fake(id: u128) -> Self {
        Self(id)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

impl Default for Pid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the first 8 hex digits are plenty to tell participants apart in logs
        write!(f, "Pid({:.8})", self.to_string())
    }
}

/// Stream identifier, unique within a participant and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct Sid(u64);

impl Sid {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Sid {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit secret exchanged during the handshake. Compared, never logged.
#[derive(Clone, Copy, Eq)]
pub struct Secret(u128);

impl Secret {
    /// Generate a secret from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        if getrandom::fill(&mut bytes).is_err() {
            // fall back to the thread rng; still unpredictable for a peer
            bytes = rand::random();
        }
        Self(u128::from_le_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        let a = self.to_bytes();
        let b = other.to_bytes();
        a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

bitflags! {
    /// Delivery guarantees requested for one stream.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Promises: u8 {
        const ORDERED = 0b0000_0001;
        const CONSISTENCY = 0b0000_0010;
        const GUARANTEED_DELIVERY = 0b0000_0100;
        const COMPRESSED = 0b0000_1000;
        const ENCRYPTED = 0b0001_0000;
    }
}

bitflags! {
    /// Optional capabilities negotiated during the handshake.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HandshakeFeatures: u32 {
        const RELIABLE_UDP = 0b0001;
        const COMPRESSION = 0b0010;
        const ENCRYPTION = 0b0100;
    }
}

impl HandshakeFeatures {
    /// Features both sides declared.
    pub fn negotiate(self, remote: HandshakeFeatures) -> HandshakeFeatures {
        self & remote
    }
}

/// Parameters a stream is opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    pub prio: Prio,
    pub promises: Promises,
    /// Bytes per second reserved for this stream, 0 means unmetered.
    pub guaranteed_bandwidth: Bandwidth,
}

impl StreamParams {
    pub fn new(promises: Promises) -> Self {
        Self {
            prio: 5,
            promises,
            guaranteed_bandwidth: 0,
        }
    }

    pub fn with_prio(mut self, prio: Prio) -> Self {
        self.prio = prio.min(LOWEST_PRIO);
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: Bandwidth) -> Self {
        self.guaranteed_bandwidth = bandwidth;
        self
    }
}

impl Default for StreamParams {
    fn default() -> Self {
        Self::new(Promises::ORDERED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_bytes_roundtrip() {
        let pid = Pid::new();
        assert_eq!(Pid::from_bytes(pid.to_bytes()), pid);
        assert_ne!(Pid::new(), pid);
    }

    #[test]
    fn test_secret_never_printed() {
        let secret = Secret::generate();
        let printed = format!("{secret:?}");
        assert!(!printed.contains(&format!("{:x}", secret.0)));
        assert_eq!(secret, Secret::from_bytes(secret.to_bytes()));
    }

    #[test]
    fn test_features_intersection() {
        let a = HandshakeFeatures::COMPRESSION | HandshakeFeatures::ENCRYPTION;
        let b = HandshakeFeatures::ENCRYPTION | HandshakeFeatures::RELIABLE_UDP;
        assert_eq!(a.negotiate(b), HandshakeFeatures::ENCRYPTION);
        assert!(a.contains(a.negotiate(b)));
        assert!(b.contains(a.negotiate(b)));
    }

    #[test]
    fn test_sid_ranges_disjoint() {
        assert!(STREAM_ID_OFFSET1 < STREAM_ID_OFFSET2);
        assert_eq!(STREAM_ID_OFFSET2.value(), u64::MAX / 2);
    }

    #[test]
    fn test_stream_params_prio_clamped() {
        let params = StreamParams::new(Promises::ORDERED).with_prio(42);
        assert_eq!(params.prio, LOWEST_PRIO);
    }
}
