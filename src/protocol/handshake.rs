//! Connection handshake.
//!
//! Run once per physical connection before any stream traffic. Both sides agree
//! on the magic number and version, exchange their participant id and secret,
//! and intersect their declared [`HandshakeFeatures`].
//!
//! ## States
//! ```text
//! SendHandshake -> ReceiveHandshake -> SendInit -> ReceiveInit
//!     -> SendConfirm -> ReceiveConfirm -> Complete
//! ```
//! The acceptor runs each pair mirrored (receive before send). It learns the
//! initiator's version first and answers with `min(local, remote)`, so both ends
//! settle on the same version.
//!
//! ## Legacy mode
//! Peers below network version `0.6` know neither the features field nor the
//! confirmation round-trip. When the agreed minor version is below 6 both are
//! skipped and the negotiated features are empty.
//!
//! ## Wire
//! Byte streams carry the untagged format:
//! ```text
//! magic(7) || major(u32) || minor(u32) || patch(u32)
//! pid(16) || secret(16) || [features(u32)]
//! [confirm(u8) = 1]
//! ```
//! Datagram transports send the same steps as tagged [`InitFrame`]s, one per
//! datagram, so a handshake datagram can be told apart from steady-state traffic.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::core::frame::InitFrame;
use crate::core::types::{
    HandshakeFeatures, Pid, Secret, Sid, STREAM_ID_OFFSET1, STREAM_ID_OFFSET2,
    VELOREN_MAGIC_NUMBER, VELOREN_NETWORK_VERSION,
};
use crate::error::{InitProtocolError, NetworkConnectError};
use crate::transport::udp::DatagramChannel;

/// First minor version that carries features and the confirmation byte.
pub const FEATURES_SINCE_MINOR: u32 = 6;

/// Confirmation byte closing a non-legacy handshake.
pub const CONFIRM_BYTE: u8 = 1;

/// Size of `magic || version`.
pub const HEADER_LEN: usize = 7 + 3 * 4;

/// Size of a legacy handshake buffer (header, pid, secret).
pub const LEGACY_HANDSHAKE_LEN: usize = HEADER_LEN + 16 + 16;

/// Size of a full handshake buffer (header, pid, secret, features).
pub const FULL_HANDSHAKE_LEN: usize = LEGACY_HANDSHAKE_LEN + 4;

/// Which end of the connection runs the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dialing side; allocates stream ids from [`STREAM_ID_OFFSET1`].
    Initiator,
    /// The accepting side; allocates stream ids from [`STREAM_ID_OFFSET2`].
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    SendHandshake,
    ReceiveHandshake,
    SendInit,
    ReceiveInit,
    SendConfirm,
    ReceiveConfirm,
    Complete,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub remote_pid: Pid,
    pub remote_secret: Secret,
    /// Intersection of both sides' declared features; empty in legacy mode.
    pub features: HandshakeFeatures,
    /// Version both sides agreed on.
    pub version: [u32; 3],
    pub legacy: bool,
    /// First stream id this side allocates.
    pub sid_offset: Sid,
}

/// Fields of a complete handshake buffer, see [`parse_handshake`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHandshake {
    pub version: [u32; 3],
    pub pid: Pid,
    pub secret: Secret,
    pub features: HandshakeFeatures,
    pub legacy: bool,
}

/// Whether two peers agreeing on `version` skip features and confirmation.
pub fn is_legacy(version: [u32; 3]) -> bool {
    version[1] < FEATURES_SINCE_MINOR
}

/// Check magic number and version of a received header against `local`.
///
/// The major version must match and the minor version must not be newer
/// than the local one.
pub fn validate_header(
    magic_number: [u8; 7],
    version: [u32; 3],
    local: [u32; 3],
) -> Result<(), InitProtocolError> {
    if magic_number != VELOREN_MAGIC_NUMBER {
        return Err(InitProtocolError::WrongMagicNumber(magic_number));
    }
    if version[0] != local[0] || version[1] > local[1] {
        return Err(InitProtocolError::WrongVersion(version));
    }
    Ok(())
}

/// Serialize a complete handshake buffer (header and init). The features field
/// is left out when `version` is a legacy version.
pub fn handshake_bytes(
    version: [u32; 3],
    pid: Pid,
    secret: Secret,
    features: HandshakeFeatures,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FULL_HANDSHAKE_LEN);
    write_header(&mut buf, version);
    write_init(&mut buf, pid, secret, (!is_legacy(version)).then_some(features));
    buf
}

/// Parse a buffer produced by [`handshake_bytes`] (or an older peer).
///
/// A legacy-sized buffer, or any buffer carrying a legacy version, yields
/// empty features. A buffer whose minor version is newer than ours is rejected.
pub fn parse_handshake(bytes: &[u8]) -> Result<ParsedHandshake, InitProtocolError> {
    if bytes.len() != LEGACY_HANDSHAKE_LEN && bytes.len() != FULL_HANDSHAKE_LEN {
        return Err(InitProtocolError::NotHandshake);
    }
    let (magic_number, version) = read_header(&bytes[..HEADER_LEN]);
    validate_header(magic_number, version, VELOREN_NETWORK_VERSION)?;

    let (pid, secret) = read_pid_secret(&bytes[HEADER_LEN..LEGACY_HANDSHAKE_LEN]);
    let legacy = is_legacy(version);
    let features = if legacy || bytes.len() == LEGACY_HANDSHAKE_LEN {
        HandshakeFeatures::empty()
    } else {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[LEGACY_HANDSHAKE_LEN..]);
        HandshakeFeatures::from_bits_truncate(u32::from_le_bytes(raw))
    };

    Ok(ParsedHandshake {
        version,
        pid,
        secret,
        features,
        legacy,
    })
}

fn write_header(buf: &mut Vec<u8>, version: [u32; 3]) {
    buf.extend_from_slice(&VELOREN_MAGIC_NUMBER);
    for part in version {
        buf.extend_from_slice(&part.to_le_bytes());
    }
}

fn write_init(buf: &mut Vec<u8>, pid: Pid, secret: Secret, features: Option<HandshakeFeatures>) {
    buf.extend_from_slice(&pid.to_bytes());
    buf.extend_from_slice(&secret.to_bytes());
    if let Some(features) = features {
        buf.extend_from_slice(&features.bits().to_le_bytes());
    }
}

fn read_header(bytes: &[u8]) -> ([u8; 7], [u32; 3]) {
    let mut magic_number = [0u8; 7];
    magic_number.copy_from_slice(&bytes[..7]);
    let mut version = [0u32; 3];
    for (i, part) in version.iter_mut().enumerate() {
        let at = 7 + i * 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[at..at + 4]);
        *part = u32::from_le_bytes(raw);
    }
    (magic_number, version)
}

fn read_pid_secret(bytes: &[u8]) -> (Pid, Secret) {
    let mut pid = [0u8; 16];
    pid.copy_from_slice(&bytes[..16]);
    let mut secret = [0u8; 16];
    secret.copy_from_slice(&bytes[16..32]);
    (Pid::from_bytes(pid), Secret::from_bytes(secret))
}

/// Remote identity received in the init step.
struct RemoteInit {
    pid: Pid,
    secret: Secret,
    features: HandshakeFeatures,
}

/// Where the handshake bytes travel.
enum Wire<'a> {
    Stream {
        reader: &'a mut (dyn AsyncRead + Send + Unpin),
        writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    },
    Datagram(&'a mut DatagramChannel),
}

impl Wire<'_> {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InitProtocolError> {
        match self {
            Wire::Stream { reader, .. } => match reader.read_exact(buf).await {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Err(InitProtocolError::NotHandshake)
                }
                Err(e) => Err(InitProtocolError::Io(e)),
            },
            Wire::Datagram(_) => Err(InitProtocolError::UnexpectedFrame {
                expected: "datagram frame",
            }),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), InitProtocolError> {
        match self {
            Wire::Stream { writer, .. } => {
                writer.write_all(bytes).await?;
                writer.flush().await?;
                Ok(())
            }
            Wire::Datagram(_) => Err(InitProtocolError::UnexpectedFrame {
                expected: "stream bytes",
            }),
        }
    }
}

/// One handshake run.
#[derive(Debug)]
pub struct Handshake {
    local_pid: Pid,
    local_secret: Secret,
    features: HandshakeFeatures,
    role: Role,
    version: [u32; 3],
    state: HandshakeState,
}

impl Handshake {
    pub fn new(
        local_pid: Pid,
        local_secret: Secret,
        features: HandshakeFeatures,
        role: Role,
    ) -> Self {
        let state = match role {
            Role::Initiator => HandshakeState::SendHandshake,
            Role::Acceptor => HandshakeState::ReceiveHandshake,
        };
        Self {
            local_pid,
            local_secret,
            features,
            role,
            version: VELOREN_NETWORK_VERSION,
            state,
        }
    }

    /// Announce a different local version, e.g. to act as an older peer.
    pub fn with_version(mut self, version: [u32; 3]) -> Self {
        self.version = version;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run over a byte stream (TCP, QUIC, in-process pipe).
    pub async fn run_stream<R, W>(
        mut self,
        reader: &mut R,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<HandshakeOutcome, NetworkConnectError>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let wire = Wire::Stream { reader, writer };
        self.run(wire, cancel).await
    }

    /// Run over a datagram peer using tagged init frames.
    pub(crate) async fn run_datagram(
        mut self,
        channel: &mut DatagramChannel,
        cancel: &CancellationToken,
    ) -> Result<HandshakeOutcome, NetworkConnectError> {
        self.run(Wire::Datagram(channel), cancel).await
    }

    #[instrument(skip_all, fields(role = ?self.role, pid = %self.local_pid))]
    async fn run(
        &mut self,
        mut wire: Wire<'_>,
        cancel: &CancellationToken,
    ) -> Result<HandshakeOutcome, NetworkConnectError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NetworkConnectError::Cancelled),
            result = self.drive(&mut wire) => result.map_err(NetworkConnectError::from),
        };
        match &result {
            Ok(outcome) => debug!(
                remote = %outcome.remote_pid,
                version = ?outcome.version,
                legacy = outcome.legacy,
                features = ?outcome.features,
                "Handshake complete"
            ),
            Err(e) => warn!(state = %self.state, error = %e, "Handshake failed"),
        }
        result
    }

    fn advance(&mut self, next: HandshakeState) {
        trace!(from = %self.state, to = %next, "Handshake step");
        self.state = next;
    }

    async fn drive(&mut self, wire: &mut Wire<'_>) -> Result<HandshakeOutcome, InitProtocolError> {
        let (version, remote) = match self.role {
            Role::Initiator => {
                self.send_handshake(wire, self.version).await?;
                self.advance(HandshakeState::ReceiveHandshake);
                let version = self.receive_handshake(wire).await?;
                let legacy = is_legacy(version);

                self.advance(HandshakeState::SendInit);
                self.send_init(wire, legacy).await?;
                self.advance(HandshakeState::ReceiveInit);
                let remote = self.receive_init(wire, legacy).await?;

                if !legacy {
                    self.advance(HandshakeState::SendConfirm);
                    self.send_confirm(wire).await?;
                    self.advance(HandshakeState::ReceiveConfirm);
                    self.receive_confirm(wire).await?;
                }
                (version, remote)
            }
            Role::Acceptor => {
                let remote_version = self.receive_handshake(wire).await?;
                let version = remote_version.min(self.version);
                let legacy = is_legacy(version);
                self.advance(HandshakeState::SendHandshake);
                self.send_handshake(wire, version).await?;

                self.advance(HandshakeState::ReceiveInit);
                let remote = self.receive_init(wire, legacy).await?;
                self.advance(HandshakeState::SendInit);
                self.send_init(wire, legacy).await?;

                if !legacy {
                    self.advance(HandshakeState::ReceiveConfirm);
                    self.receive_confirm(wire).await?;
                    self.advance(HandshakeState::SendConfirm);
                    self.send_confirm(wire).await?;
                }
                (version, remote)
            }
        };
        self.advance(HandshakeState::Complete);

        let legacy = is_legacy(version);
        let features = if legacy {
            HandshakeFeatures::empty()
        } else {
            self.features.negotiate(remote.features)
        };
        Ok(HandshakeOutcome {
            remote_pid: remote.pid,
            remote_secret: remote.secret,
            features,
            version,
            legacy,
            sid_offset: match self.role {
                Role::Initiator => STREAM_ID_OFFSET1,
                Role::Acceptor => STREAM_ID_OFFSET2,
            },
        })
    }

    async fn send_handshake(
        &self,
        wire: &mut Wire<'_>,
        version: [u32; 3],
    ) -> Result<(), InitProtocolError> {
        match wire {
            Wire::Datagram(channel) => {
                channel
                    .send_init(InitFrame::Handshake {
                        magic_number: VELOREN_MAGIC_NUMBER,
                        version,
                    })
                    .await
            }
            Wire::Stream { .. } => {
                let mut buf = Vec::with_capacity(HEADER_LEN);
                write_header(&mut buf, version);
                wire.write_all(&buf).await
            }
        }
    }

    async fn receive_handshake(&self, wire: &mut Wire<'_>) -> Result<[u32; 3], InitProtocolError> {
        let (magic_number, version) = match wire {
            Wire::Datagram(channel) => match channel.recv_init().await? {
                InitFrame::Handshake {
                    magic_number,
                    version,
                } => (magic_number, version),
                _ => {
                    return Err(InitProtocolError::UnexpectedFrame {
                        expected: "Handshake",
                    })
                }
            },
            Wire::Stream { .. } => {
                let mut buf = [0u8; HEADER_LEN];
                wire.read_exact(&mut buf).await?;
                read_header(&buf)
            }
        };
        validate_header(magic_number, version, self.version)?;
        Ok(version)
    }

    async fn send_init(&self, wire: &mut Wire<'_>, legacy: bool) -> Result<(), InitProtocolError> {
        match wire {
            Wire::Datagram(channel) => {
                channel
                    .send_init(InitFrame::Init {
                        pid: self.local_pid,
                        secret: self.local_secret,
                        features: if legacy {
                            HandshakeFeatures::empty()
                        } else {
                            self.features
                        },
                    })
                    .await
            }
            Wire::Stream { .. } => {
                let mut buf = Vec::with_capacity(36);
                write_init(
                    &mut buf,
                    self.local_pid,
                    self.local_secret,
                    (!legacy).then_some(self.features),
                );
                wire.write_all(&buf).await
            }
        }
    }

    async fn receive_init(
        &self,
        wire: &mut Wire<'_>,
        legacy: bool,
    ) -> Result<RemoteInit, InitProtocolError> {
        match wire {
            Wire::Datagram(channel) => loop {
                match channel.recv_init().await? {
                    InitFrame::Init {
                        pid,
                        secret,
                        features,
                    } => {
                        return Ok(RemoteInit {
                            pid,
                            secret,
                            features,
                        })
                    }
                    // a repeated header is re-validated and otherwise ignored
                    InitFrame::Handshake {
                        magic_number,
                        version,
                    } => validate_header(magic_number, version, self.version)?,
                    InitFrame::Raw(_) => {
                        return Err(InitProtocolError::UnexpectedFrame { expected: "Init" })
                    }
                }
            },
            Wire::Stream { .. } => {
                let mut buf = [0u8; 36];
                let len = if legacy { 32 } else { 36 };
                wire.read_exact(&mut buf[..len]).await?;
                let (pid, secret) = read_pid_secret(&buf[..32]);
                let features = if legacy {
                    HandshakeFeatures::empty()
                } else {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&buf[32..36]);
                    HandshakeFeatures::from_bits_truncate(u32::from_le_bytes(raw))
                };
                Ok(RemoteInit {
                    pid,
                    secret,
                    features,
                })
            }
        }
    }

    async fn send_confirm(&self, wire: &mut Wire<'_>) -> Result<(), InitProtocolError> {
        match wire {
            Wire::Datagram(channel) => channel.send_init(InitFrame::Raw(vec![CONFIRM_BYTE])).await,
            Wire::Stream { .. } => wire.write_all(&[CONFIRM_BYTE]).await,
        }
    }

    async fn receive_confirm(&self, wire: &mut Wire<'_>) -> Result<(), InitProtocolError> {
        let byte = match wire {
            Wire::Datagram(channel) => loop {
                match channel.recv_init().await {
                    Ok(InitFrame::Raw(data)) => match data.as_slice() {
                        [byte] => break *byte,
                        _ => return Err(InitProtocolError::MissingConfirmation),
                    },
                    Ok(InitFrame::Handshake {
                        magic_number,
                        version,
                    }) => validate_header(magic_number, version, self.version)?,
                    // the peer repeated its init, its confirmation may follow
                    Ok(InitFrame::Init { .. }) => {}
                    Err(InitProtocolError::NotHandshake) => {
                        return Err(InitProtocolError::MissingConfirmation)
                    }
                    Err(e) => return Err(e),
                }
            },
            Wire::Stream { .. } => {
                let mut buf = [0u8; 1];
                match wire.read_exact(&mut buf).await {
                    Ok(()) => buf[0],
                    Err(InitProtocolError::NotHandshake) => {
                        return Err(InitProtocolError::MissingConfirmation)
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if byte != CONFIRM_BYTE {
            return Err(InitProtocolError::WrongConfirmation(byte));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    async fn run_pair(
        initiator: Handshake,
        acceptor: Handshake,
    ) -> (
        Result<HandshakeOutcome, NetworkConnectError>,
        Result<HandshakeOutcome, NetworkConnectError>,
    ) {
        let (a, b) = duplex(256);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let accept = tokio::spawn(async move {
            let (mut r, mut w) = split(b);
            acceptor.run_stream(&mut r, &mut w, &cancel2).await
        });
        let (mut r, mut w) = split(a);
        let init = initiator.run_stream(&mut r, &mut w, &cancel).await;
        drop((r, w));
        (init, accept.await.unwrap())
    }

    fn default_initiator() -> Handshake {
        let features = HandshakeFeatures::all();
        Handshake::new(Pid::fake(1), Secret::generate(), features, Role::Initiator)
    }

    fn default_acceptor() -> Handshake {
        let features = HandshakeFeatures::all();
        Handshake::new(Pid::fake(2), Secret::generate(), features, Role::Acceptor)
    }

    #[tokio::test]
    async fn test_features_are_intersected() {
        let (pid_a, pid_b) = (Pid::fake(1), Pid::fake(2));
        let (secret_a, secret_b) = (Secret::generate(), Secret::generate());
        let a = Handshake::new(
            pid_a,
            secret_a,
            HandshakeFeatures::COMPRESSION | HandshakeFeatures::ENCRYPTION,
            Role::Initiator,
        );
        let b = Handshake::new(
            pid_b,
            secret_b,
            HandshakeFeatures::ENCRYPTION | HandshakeFeatures::RELIABLE_UDP,
            Role::Acceptor,
        );
        let (ra, rb) = run_pair(a, b).await;
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.remote_pid, pid_b);
        assert_eq!(rb.remote_pid, pid_a);
        assert_eq!(ra.remote_secret, secret_b);
        assert_eq!(rb.remote_secret, secret_a);
        assert_eq!(ra.features, HandshakeFeatures::ENCRYPTION);
        assert_eq!(rb.features, HandshakeFeatures::ENCRYPTION);
        assert_eq!(ra.sid_offset, STREAM_ID_OFFSET1);
        assert_eq!(rb.sid_offset, STREAM_ID_OFFSET2);
        assert!(!ra.legacy && !rb.legacy);
    }

    #[tokio::test]
    async fn test_older_initiator_runs_legacy() {
        let a = default_initiator().with_version([0, 5, 0]);
        let b = default_acceptor();
        let (ra, rb) = run_pair(a, b).await;
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra.legacy && rb.legacy);
        assert_eq!(ra.version, [0, 5, 0]);
        assert_eq!(rb.version, [0, 5, 0]);
        assert_eq!(ra.features, HandshakeFeatures::empty());
        assert_eq!(rb.features, HandshakeFeatures::empty());
    }

    #[tokio::test]
    async fn test_newer_minor_rejected() {
        let a = default_initiator().with_version([0, 9, 0]);
        let b = default_acceptor();
        let (_, rb) = run_pair(a, b).await;
        match rb {
            Err(NetworkConnectError::Handshake(InitProtocolError::WrongVersion(v))) => {
                assert_eq!(v, [0, 9, 0])
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_magic_rejected() {
        let (a, b) = duplex(256);
        let (mut r, mut w) = split(b);
        let writer = tokio::spawn(async move {
            let (_r, mut w) = split(a);
            let mut bytes = b"VELORAN".to_vec();
            bytes.extend_from_slice(&[0u8; 12]);
            w.write_all(&bytes).await.unwrap();
            w
        });
        let result = default_acceptor()
            .run_stream(&mut r, &mut w, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(NetworkConnectError::Handshake(InitProtocolError::WrongMagicNumber(m)))
                if &m == b"VELORAN"
        ));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_not_a_handshake() {
        let (a, b) = duplex(256);
        let (mut r, mut w) = split(b);
        {
            let (_r, mut wa) = split(a);
            wa.write_all(b"VELO").await.unwrap();
        }
        let result = default_acceptor()
            .run_stream(&mut r, &mut w, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(NetworkConnectError::Handshake(InitProtocolError::NotHandshake))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_handshake() {
        let (_a, b) = duplex(256);
        let (mut r, mut w) = split(b);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = default_acceptor()
            .run_stream(&mut r, &mut w, &cancel)
            .await;
        assert!(matches!(result, Err(NetworkConnectError::Cancelled)));
    }

    #[test]
    fn test_parse_full_buffer() {
        let pid = Pid::fake(77);
        let secret = Secret::from_bytes([3; 16]);
        let features = HandshakeFeatures::COMPRESSION;
        let bytes = handshake_bytes(VELOREN_NETWORK_VERSION, pid, secret, features);
        assert_eq!(bytes.len(), FULL_HANDSHAKE_LEN);
        let parsed = parse_handshake(&bytes).unwrap();
        assert_eq!(parsed.pid, pid);
        assert_eq!(parsed.secret, secret);
        assert_eq!(parsed.features, HandshakeFeatures::COMPRESSION);
        assert!(!parsed.legacy);
    }

    #[test]
    fn test_parse_legacy_buffer() {
        let bytes =
            handshake_bytes([0, 5, 0], Pid::fake(1), Secret::generate(), HandshakeFeatures::all());
        assert_eq!(bytes.len(), LEGACY_HANDSHAKE_LEN);
        let parsed = parse_handshake(&bytes).unwrap();
        assert!(parsed.legacy);
        assert_eq!(parsed.features, HandshakeFeatures::empty());
    }

    #[test]
    fn test_parse_rejects_future_minor() {
        let bytes =
            handshake_bytes([0, 9, 0], Pid::fake(1), Secret::generate(), HandshakeFeatures::all());
        assert!(matches!(
            parse_handshake(&bytes),
            Err(InitProtocolError::WrongVersion([0, 9, 0]))
        ));
        assert!(matches!(
            parse_handshake(&bytes[..10]),
            Err(InitProtocolError::NotHandshake)
        ));
    }
}
