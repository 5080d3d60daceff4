//! TCP transport.
//!
//! Nagle is disabled on every socket; frames are small and latency matters more
//! than packet count.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{BoxedRead, BoxedWrite};

pub(crate) async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    debug!(addr = %listener.local_addr()?, "TCP listener bound");
    Ok(listener)
}

pub(crate) async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Prepare an accepted socket.
pub(crate) fn accepted(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

pub(crate) fn boxed(
    read: tokio::net::tcp::OwnedReadHalf,
    write: tokio::net::tcp::OwnedWriteHalf,
) -> (BoxedRead, BoxedWrite) {
    (Box::new(read), Box::new(write))
}
