//! # Transport Layer
//!
//! Physical connections a participant can run over.
//!
//! ## Transports
//! - **TCP**: one byte stream, frames via [`crate::core::codec::FrameCodec`]
//! - **UDP**: one shared socket per listener, whole frames per datagram
//! - **QUIC**: a control stream plus one native stream per application stream
//! - **In-process**: `u64`-addressed registry, stream payloads handed over directly
//!
//! Every transport runs the same handshake before it is handed to a participant.

pub mod mpsc;
pub mod quic;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc as channel;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::core::codec::FrameCodec;
use crate::core::frame::{ITFrame, OTFrame};
use crate::error::ParticipantResult;

use self::mpsc::LocalFrame;
use self::udp::{DatagramReceiver, DatagramSender};

/// Kind of physical transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Tcp,
    Udp,
    Quic,
    Mpsc,
}

impl ProtocolKind {
    pub const COUNT: usize = 4;

    pub const ALL: [ProtocolKind; Self::COUNT] = [
        ProtocolKind::Tcp,
        ProtocolKind::Udp,
        ProtocolKind::Quic,
        ProtocolKind::Mpsc,
    ];

    pub fn index(self) -> usize {
        match self {
            ProtocolKind::Tcp => 0,
            ProtocolKind::Udp => 1,
            ProtocolKind::Quic => 2,
            ProtocolKind::Mpsc => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::Udp => "udp",
            ProtocolKind::Quic => "quic",
            ProtocolKind::Mpsc => "mpsc",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to dial.
#[derive(Clone)]
pub enum ConnectAddr {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    /// Remote address, client crypto config and the server name to verify.
    Quic(SocketAddr, quinn::ClientConfig, String),
    /// In-process listener id.
    Mpsc(u64),
}

impl ConnectAddr {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            ConnectAddr::Tcp(_) => ProtocolKind::Tcp,
            ConnectAddr::Udp(_) => ProtocolKind::Udp,
            ConnectAddr::Quic(..) => ProtocolKind::Quic,
            ConnectAddr::Mpsc(_) => ProtocolKind::Mpsc,
        }
    }
}

impl fmt::Debug for ConnectAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectAddr::Tcp(addr) => write!(f, "Tcp({addr})"),
            ConnectAddr::Udp(addr) => write!(f, "Udp({addr})"),
            ConnectAddr::Quic(addr, _, name) => write!(f, "Quic({addr}, {name})"),
            ConnectAddr::Mpsc(id) => write!(f, "Mpsc({id})"),
        }
    }
}

/// Where to accept connections.
#[derive(Clone)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Quic(SocketAddr, quinn::ServerConfig),
    Mpsc(u64),
}

impl ListenAddr {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            ListenAddr::Tcp(_) => ProtocolKind::Tcp,
            ListenAddr::Udp(_) => ProtocolKind::Udp,
            ListenAddr::Quic(..) => ProtocolKind::Quic,
            ListenAddr::Mpsc(_) => ProtocolKind::Mpsc,
        }
    }

    /// Socket address for network transports.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenAddr::Tcp(addr) | ListenAddr::Udp(addr) | ListenAddr::Quic(addr, _) => {
                Some(*addr)
            }
            ListenAddr::Mpsc(_) => None,
        }
    }
}

impl fmt::Debug for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "Tcp({addr})"),
            ListenAddr::Udp(addr) => write!(f, "Udp({addr})"),
            ListenAddr::Quic(addr, _) => write!(f, "Quic({addr})"),
            ListenAddr::Mpsc(id) => write!(f, "Mpsc({id})"),
        }
    }
}

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Outgoing half of a framed connection.
pub(crate) enum FrameSink {
    Stream(FramedWrite<BoxedWrite, FrameCodec>),
    Datagram(DatagramSender),
}

impl FrameSink {
    pub(crate) fn stream(writer: BoxedWrite) -> Self {
        FrameSink::Stream(FramedWrite::new(writer, FrameCodec))
    }

    /// Queue one frame, returning the bytes it will occupy on the wire. Byte
    /// streams buffer until [`FrameSink::flush`]; datagrams go out immediately.
    pub(crate) async fn feed(&mut self, frame: OTFrame) -> ParticipantResult<usize> {
        match self {
            FrameSink::Stream(writer) => {
                let len = frame.encoded_len();
                writer.feed(frame).await?;
                Ok(len)
            }
            FrameSink::Datagram(sender) => sender.send(&frame).await,
        }
    }

    pub(crate) async fn flush(&mut self) -> ParticipantResult<()> {
        match self {
            FrameSink::Stream(writer) => writer.flush().await,
            FrameSink::Datagram(_) => Ok(()),
        }
    }
}

/// Incoming half of a framed connection.
pub(crate) enum FrameSource {
    Stream(FramedRead<BoxedRead, FrameCodec>),
    Datagram(DatagramReceiver),
}

impl FrameSource {
    pub(crate) fn stream(reader: BoxedRead) -> Self {
        FrameSource::Stream(FramedRead::new(reader, FrameCodec))
    }

    pub(crate) async fn next(&mut self) -> Option<ParticipantResult<ITFrame>> {
        match self {
            FrameSource::Stream(reader) => reader.next().await,
            FrameSource::Datagram(receiver) => receiver.next().await,
        }
    }
}

/// A handshaken connection, ready to be driven by a participant.
pub(crate) enum Link {
    /// TCP or UDP.
    Framed {
        sink: FrameSink,
        source: FrameSource,
        /// Largest `Data` payload per frame.
        chunk_size: usize,
    },
    Local {
        tx: channel::UnboundedSender<LocalFrame>,
        rx: channel::UnboundedReceiver<LocalFrame>,
    },
    Quic {
        connection: quinn::Connection,
        /// Held so a dialer's endpoint outlives its only connection.
        endpoint: Option<quinn::Endpoint>,
        sink: FrameSink,
        source: FrameSource,
    },
}

impl Link {
    pub(crate) fn datagram(channel: udp::DatagramChannel, chunk_size: usize) -> Self {
        let (sender, receiver) = channel.into_parts();
        Link::Framed {
            sink: FrameSink::Datagram(sender),
            source: FrameSource::Datagram(receiver),
            chunk_size,
        }
    }

    pub(crate) fn byte_stream(reader: BoxedRead, writer: BoxedWrite, chunk_size: usize) -> Self {
        Link::Framed {
            sink: FrameSink::stream(writer),
            source: FrameSource::stream(reader),
            chunk_size,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_indices_are_dense() {
        for (i, kind) in ProtocolKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(ConnectAddr::Mpsc(3).protocol(), ProtocolKind::Mpsc);
        assert_eq!(
            ListenAddr::Udp("127.0.0.1:1".parse().unwrap()).protocol(),
            ProtocolKind::Udp
        );
        assert_eq!(format!("{:?}", ConnectAddr::Mpsc(7)), "Mpsc(7)");
    }
}
