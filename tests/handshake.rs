//! Handshake buffers and version negotiation through the public API

#![allow(clippy::expect_used, clippy::unwrap_used)]

use mux_network::core::types::{HandshakeFeatures, Pid, Secret, VELOREN_NETWORK_VERSION};
use mux_network::error::{InitProtocolError, NetworkConnectError};
use mux_network::protocol::handshake::{
    handshake_bytes, parse_handshake, Handshake, Role, FULL_HANDSHAKE_LEN, LEGACY_HANDSHAKE_LEN,
};
use tokio::io::{duplex, split};
use tokio_util::sync::CancellationToken;

#[test]
fn test_legacy_version_parses_without_features() {
    let bytes = handshake_bytes(
        [0, 5, 0],
        Pid::fake(5),
        Secret::from_bytes([1; 16]),
        HandshakeFeatures::all(),
    );
    assert_eq!(bytes.len(), LEGACY_HANDSHAKE_LEN);

    let parsed = parse_handshake(&bytes).unwrap();
    assert!(parsed.legacy);
    assert_eq!(parsed.version, [0, 5, 0]);
    assert_eq!(parsed.pid, Pid::fake(5));
    assert_eq!(parsed.features, HandshakeFeatures::empty());
}

#[test]
fn test_future_minor_version_rejected() {
    let bytes = handshake_bytes(
        [0, 9, 0],
        Pid::fake(9),
        Secret::from_bytes([2; 16]),
        HandshakeFeatures::COMPRESSION,
    );
    assert_eq!(bytes.len(), FULL_HANDSHAKE_LEN);
    assert!(matches!(
        parse_handshake(&bytes),
        Err(InitProtocolError::WrongVersion([0, 9, 0]))
    ));
}

#[test]
fn test_current_version_keeps_features() {
    let bytes = handshake_bytes(
        VELOREN_NETWORK_VERSION,
        Pid::fake(6),
        Secret::from_bytes([3; 16]),
        HandshakeFeatures::RELIABLE_UDP,
    );
    let parsed = parse_handshake(&bytes).unwrap();
    assert!(!parsed.legacy);
    assert_eq!(parsed.features, HandshakeFeatures::RELIABLE_UDP);
    assert_eq!(parsed.secret, Secret::from_bytes([3; 16]));
}

#[tokio::test]
async fn test_handshake_over_pipe_intersects_features() {
    let (a, b) = duplex(1024);
    let cancel = CancellationToken::new();

    let initiator = Handshake::new(
        Pid::fake(1),
        Secret::from_bytes([1; 16]),
        HandshakeFeatures::COMPRESSION | HandshakeFeatures::ENCRYPTION,
        Role::Initiator,
    );
    let acceptor = Handshake::new(
        Pid::fake(2),
        Secret::from_bytes([2; 16]),
        HandshakeFeatures::ENCRYPTION | HandshakeFeatures::RELIABLE_UDP,
        Role::Acceptor,
    );

    let accept_cancel = cancel.clone();
    let accept = tokio::spawn(async move {
        let (mut read, mut write) = split(b);
        acceptor.run_stream(&mut read, &mut write, &accept_cancel).await
    });
    let (mut read, mut write) = split(a);
    let dialed = initiator
        .run_stream(&mut read, &mut write, &cancel)
        .await
        .unwrap();
    let accepted = accept.await.unwrap().unwrap();

    assert_eq!(dialed.remote_pid, Pid::fake(2));
    assert_eq!(accepted.remote_pid, Pid::fake(1));
    assert_eq!(dialed.features, HandshakeFeatures::ENCRYPTION);
    assert_eq!(accepted.features, HandshakeFeatures::ENCRYPTION);
    assert_ne!(dialed.sid_offset, accepted.sid_offset);
    assert!(!dialed.legacy && !accepted.legacy);
}

#[tokio::test]
async fn test_peer_hanging_up_is_not_a_handshake() {
    let (a, b) = duplex(1024);
    drop(b);
    let handshake = Handshake::new(
        Pid::fake(1),
        Secret::generate(),
        HandshakeFeatures::all(),
        Role::Acceptor,
    );
    let (mut read, mut write) = split(a);
    let err = handshake
        .run_stream(&mut read, &mut write, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NetworkConnectError::Handshake(InitProtocolError::NotHandshake)
            | NetworkConnectError::Handshake(InitProtocolError::Io(_))
    ));
}
