//! QUIC transport.
//!
//! Built on `quinn`. The handshake runs on the first bidirectional stream the
//! dialer opens; that stream then stays open as the control stream carrying
//! `Shutdown`. Every application stream gets its own native bidirectional QUIC
//! stream:
//!
//! ```text
//! OpenStream frame (19 bytes) || { len(u32 LE) || envelope }*
//! ```
//!
//! Finishing the QUIC send side closes the application stream.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::QuicConfig;
use crate::core::frame::{ITFrame, OTFrame};
use crate::core::types::{Sid, StreamParams};
use crate::error::{FrameError, NetworkConnectError};

/// Size of the `OpenStream` frame leading every application stream.
pub const OPEN_HEADER_LEN: usize = 1 + 8 + 1 + 1 + 8;

/// Largest envelope accepted on an application stream.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

fn quic_err(e: impl std::fmt::Display) -> NetworkConnectError {
    NetworkConnectError::Quic(e.to_string())
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Generate a self-signed certificate for `server_name` and matching server
/// and client configs. The client trusts exactly that certificate.
pub fn self_signed_configs(
    server_name: &str,
    alpn: &[u8],
) -> Result<(quinn::ServerConfig, quinn::ClientConfig), NetworkConnectError> {
    let certified =
        rcgen::generate_simple_self_signed(vec![server_name.to_string()]).map_err(quic_err)?;
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(quic_err)?
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .map_err(quic_err)?;
    server_crypto.alpn_protocols = vec![alpn.to_vec()];
    let server_crypto = QuicServerConfig::try_from(server_crypto).map_err(quic_err)?;
    let server = quinn::ServerConfig::with_crypto(Arc::new(server_crypto));

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).map_err(quic_err)?;
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(quic_err)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![alpn.to_vec()];
    let client_crypto = QuicClientConfig::try_from(client_crypto).map_err(quic_err)?;
    let client = quinn::ClientConfig::new(Arc::new(client_crypto));

    Ok((server, client))
}

/// [`self_signed_configs`] for the names configured in `config`.
pub fn self_signed_from_config(
    config: &QuicConfig,
) -> Result<(quinn::ServerConfig, quinn::ClientConfig), NetworkConnectError> {
    self_signed_configs(&config.server_name, config.alpn.as_bytes())
}

pub(crate) fn server_endpoint(
    addr: SocketAddr,
    config: quinn::ServerConfig,
) -> io::Result<quinn::Endpoint> {
    let endpoint = quinn::Endpoint::server(config, addr)?;
    debug!(addr = %endpoint.local_addr()?, "QUIC endpoint bound");
    Ok(endpoint)
}

/// Dial `addr` from a fresh client endpoint.
pub(crate) async fn connect(
    addr: SocketAddr,
    config: quinn::ClientConfig,
    server_name: &str,
) -> Result<(quinn::Endpoint, quinn::Connection), NetworkConnectError> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = quinn::Endpoint::client(local)?;
    let connection = endpoint
        .connect_with(config, addr, server_name)
        .map_err(quic_err)?
        .await
        .map_err(quic_err)?;
    Ok((endpoint, connection))
}

/// Write the header announcing a new application stream.
pub(crate) async fn write_open(
    send: &mut quinn::SendStream,
    sid: Sid,
    params: &StreamParams,
) -> io::Result<()> {
    let frame = OTFrame::OpenStream {
        sid,
        prio: params.prio,
        promises: params.promises,
        guaranteed_bandwidth: params.guaranteed_bandwidth,
    };
    let bytes = frame
        .to_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    AsyncWriteExt::write_all(send, &bytes).await
}

/// Read the header of an application stream the peer opened.
pub(crate) async fn read_open(recv: &mut quinn::RecvStream) -> io::Result<(Sid, StreamParams)> {
    let mut buf = [0u8; OPEN_HEADER_LEN];
    AsyncReadExt::read_exact(recv, &mut buf).await?;
    let invalid = |e: FrameError| io::Error::new(io::ErrorKind::InvalidData, e);
    match ITFrame::try_deserialize(&buf).map_err(invalid)? {
        Some((
            ITFrame::OpenStream {
                sid,
                prio,
                promises,
                guaranteed_bandwidth,
            },
            _,
        )) => Ok((
            sid,
            StreamParams {
                prio,
                promises,
                guaranteed_bandwidth,
            },
        )),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "application stream does not start with OpenStream",
        )),
    }
}

pub(crate) async fn write_message(send: &mut quinn::SendStream, envelope: &[u8]) -> io::Result<()> {
    let len = u32::try_from(envelope.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    AsyncWriteExt::write_all(send, &len.to_le_bytes()).await?;
    AsyncWriteExt::write_all(send, envelope).await
}

/// Next envelope, or `None` once the peer finished the stream.
pub(crate) async fn read_message(recv: &mut quinn::RecvStream) -> io::Result<Option<Bytes>> {
    let mut len = [0u8; 4];
    match AsyncReadExt::read_exact(recv, &mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {len} bytes exceeds {MAX_MESSAGE_LEN}"),
        ));
    }
    let mut payload = vec![0u8; len];
    AsyncReadExt::read_exact(recv, &mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}
