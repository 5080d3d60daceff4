//! In-process transport.
//!
//! Listeners register under a `u64` id in a process-wide registry. Connecting
//! hands the listener a [`LocalConnection`]: an in-memory byte pipe the regular
//! handshake runs over, plus a pair of frame queues for steady-state control
//! traffic. Stream payloads bypass the queues entirely; each side pushes straight
//! into the other side's stream inbox, which is exchanged when the stream opens.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::frame::OTFrame;
use crate::core::types::{Sid, StreamParams};
use crate::protocol::prio::WaitQueue;

/// Buffer size of the in-memory handshake pipe.
const HANDSHAKE_PIPE: usize = 4096;

/// Message inbox of one stream end.
pub(crate) type Inbox = Arc<WaitQueue<Bytes>>;

/// Control traffic between two in-process participants.
#[derive(Debug)]
pub(crate) enum LocalFrame {
    /// A stream was opened. `to_opener` feeds the opening side, `to_acceptor`
    /// feeds the accepting side.
    OpenStream {
        sid: Sid,
        params: StreamParams,
        to_opener: Inbox,
        to_acceptor: Inbox,
    },
    Frame(OTFrame),
}

/// One side of an in-process connection.
#[derive(Debug)]
pub struct LocalConnection {
    pub(crate) handshake: DuplexStream,
    pub(crate) tx: mpsc::UnboundedSender<LocalFrame>,
    pub(crate) rx: mpsc::UnboundedReceiver<LocalFrame>,
}

static LISTENERS: Lazy<DashMap<u64, mpsc::UnboundedSender<LocalConnection>>> =
    Lazy::new(DashMap::new);

/// Register a listener under `id`.
///
/// # Errors
/// `AddrInUse` if a live listener already owns the id
pub(crate) fn listen(id: u64) -> io::Result<mpsc::UnboundedReceiver<LocalConnection>> {
    let (tx, rx) = mpsc::unbounded_channel();
    match LISTENERS.entry(id) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            if !entry.get().is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("in-process id {id} already has a listener"),
                ));
            }
            entry.insert(tx);
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(tx);
        }
    }
    debug!(id, "In-process listener registered");
    Ok(rx)
}

/// Remove the listener registered under `id`.
pub(crate) fn unlisten(id: u64) {
    LISTENERS.remove(&id);
}

/// Connect to the listener registered under `id`.
///
/// # Errors
/// `ConnectionRefused` if nobody listens on the id
pub(crate) fn connect(id: u64) -> io::Result<LocalConnection> {
    let refused = || {
        io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("no in-process listener with id {id}"),
        )
    };
    let listener = LISTENERS.get(&id).map(|l| l.clone()).ok_or_else(refused)?;

    let (pipe_a, pipe_b) = tokio::io::duplex(HANDSHAKE_PIPE);
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let remote = LocalConnection {
        handshake: pipe_b,
        tx: b_tx,
        rx: b_rx,
    };
    listener.send(remote).map_err(|_| refused())?;

    Ok(LocalConnection {
        handshake: pipe_a,
        tx: a_tx,
        rx: a_rx,
    })
}
