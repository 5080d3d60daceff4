//! Datagram transport.
//!
//! One UDP socket per listener serves every remote peer: a demultiplexing task
//! reads datagrams and routes them to per-peer queues by source address. A
//! datagram from an unknown address only opens a new connection when it starts
//! with a handshake frame. Dialers own their socket and a reader task feeding
//! the same kind of queue.
//!
//! Each datagram carries whole frames; a frame is never split across datagrams.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::core::codec::{FrameCodec, InitFrameCodec};
use crate::core::frame::{ITFrame, InitFrame, OTFrame, TAG_HANDSHAKE};
use crate::error::{InitProtocolError, ParticipantError, ParticipantResult};

/// Largest datagram read from the socket.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagrams queued per peer before further ones are dropped.
const PEER_QUEUE: usize = 1024;

/// Control frames are repeated this often on datagram transports.
pub const CONTROL_REPEAT: usize = 3;

/// A handshake-phase view of one remote datagram peer.
#[derive(Debug)]
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    guard: Option<DropGuard>,
}

impl DatagramChannel {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) async fn send_init(&mut self, frame: InitFrame) -> Result<(), InitProtocolError> {
        let mut buf = BytesMut::new();
        InitFrameCodec.encode(frame, &mut buf)?;
        self.socket.send_to(&buf, self.peer).await?;
        Ok(())
    }

    /// Next handshake frame. A datagram holding a truncated frame is not a
    /// handshake.
    pub(crate) async fn recv_init(&mut self) -> Result<InitFrame, InitProtocolError> {
        let datagram = self.rx.recv().await.ok_or(InitProtocolError::NotHandshake)?;
        let mut buf = BytesMut::from(&datagram[..]);
        InitFrameCodec
            .decode(&mut buf)?
            .ok_or(InitProtocolError::NotHandshake)
    }

    /// Split into the steady-state halves used by a participant.
    pub(crate) fn into_parts(self) -> (DatagramSender, DatagramReceiver) {
        (
            DatagramSender {
                socket: self.socket,
                peer: self.peer,
                buf: BytesMut::new(),
            },
            DatagramReceiver {
                rx: self.rx,
                pending: BytesMut::new(),
                _guard: self.guard,
            },
        )
    }
}

/// Sending half of a datagram peer.
#[derive(Debug)]
pub struct DatagramSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    buf: BytesMut,
}

impl DatagramSender {
    /// Send one frame as one datagram; control frames are repeated
    /// [`CONTROL_REPEAT`] times since the receiver treats them idempotently.
    pub(crate) async fn send(&mut self, frame: &OTFrame) -> ParticipantResult<usize> {
        self.buf.clear();
        frame.write_bytes(&mut self.buf)?;
        let repeat = match frame {
            OTFrame::Shutdown | OTFrame::OpenStream { .. } | OTFrame::CloseStream { .. } => {
                CONTROL_REPEAT
            }
            OTFrame::DataHeader { .. } | OTFrame::Data { .. } => 1,
        };
        for _ in 0..repeat {
            self.socket.send_to(&self.buf, self.peer).await?;
        }
        Ok(self.buf.len() * repeat)
    }
}

/// Receiving half of a datagram peer.
#[derive(Debug)]
pub struct DatagramReceiver {
    rx: mpsc::Receiver<Bytes>,
    pending: BytesMut,
    _guard: Option<DropGuard>,
}

impl DatagramReceiver {
    /// Next frame, or `None` once the peer queue is gone. Malformed datagrams
    /// are logged and skipped; one bad datagram does not end the connection.
    pub(crate) async fn next(&mut self) -> Option<ParticipantResult<ITFrame>> {
        loop {
            if !self.pending.is_empty() {
                match FrameCodec.decode(&mut self.pending) {
                    Ok(Some(frame)) => return Some(Ok(frame)),
                    Ok(None) => {
                        trace!(len = self.pending.len(), "Dropping truncated datagram tail");
                        self.pending.clear();
                    }
                    Err(ParticipantError::Protocol(e)) => {
                        warn!(error = %e, "Dropping malformed datagram");
                        self.pending.clear();
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            let datagram = self.rx.recv().await?;
            self.pending.extend_from_slice(&datagram);
        }
    }
}

/// Bind a listening socket.
pub(crate) async fn bind(addr: SocketAddr) -> io::Result<Arc<UdpSocket>> {
    Ok(Arc::new(UdpSocket::bind(addr).await?))
}

/// Route datagrams arriving on a listening socket to per-peer channels. New
/// peers are announced on `incoming`.
pub(crate) fn spawn_demux(
    socket: Arc<UdpSocket>,
    incoming: mpsc::UnboundedSender<DatagramChannel>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port unreachable surfaces here on some platforms
                        debug!(error = %e, "UDP receive error");
                        continue;
                    }
                },
            };
            let datagram = Bytes::copy_from_slice(&buf[..len]);

            if let Some(tx) = peers.get(&from) {
                match tx.try_send(datagram.clone()) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(peer = %from, "Peer queue full, dropping datagram");
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        peers.remove(&from);
                    }
                }
            }

            if datagram.first() != Some(&TAG_HANDSHAKE) {
                trace!(peer = %from, "Ignoring datagram from unknown peer");
                continue;
            }
            let (tx, rx) = mpsc::channel(PEER_QUEUE);
            let _ = tx.try_send(datagram);
            peers.insert(from, tx);
            let channel = DatagramChannel {
                socket: socket.clone(),
                peer: from,
                rx,
                guard: None,
            };
            if incoming.send(channel).is_err() {
                break;
            }
        }
        debug!("UDP demultiplexer stopped");
    });
}

/// Dial `peer` from a fresh local socket.
pub(crate) async fn connect(peer: SocketAddr) -> io::Result<DatagramChannel> {
    let local: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(local).await?);

    let (tx, rx) = mpsc::channel(PEER_QUEUE);
    let cancel = CancellationToken::new();
    let reader = socket.clone();
    let stop = cancel.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = tokio::select! {
                _ = stop.cancelled() => break,
                received = reader.recv_from(&mut buf) => match received {
                    Ok((len, from)) if from == peer => len,
                    Ok((_, from)) => {
                        trace!(from = %from, "Ignoring datagram from foreign address");
                        continue;
                    }
                    Err(e) => {
                        debug!(error = %e, "UDP receive error");
                        continue;
                    }
                },
            };
            if tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                break;
            }
        }
    });

    Ok(DatagramChannel {
        socket,
        peer,
        rx,
        guard: Some(cancel.drop_guard()),
    })
}
