//! Channels: control-plane bookkeeping for the physical connections of a
//! participant.
//!
//! A [`Channel`] records one physical connection (its id, transport kind and,
//! when there is one, the peer socket address). Channels never carry
//! application payloads; those travel on streams. [`Channel::pair`] builds two
//! connected in-process channels with a small byte queue, used for loopback
//! bookkeeping and tests.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::types::Cid;
use crate::error::{ParticipantError, ParticipantResult};
use crate::transport::ProtocolKind;

/// Description of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub cid: Cid,
    pub protocol: ProtocolKind,
    pub peer: Option<SocketAddr>,
}

#[derive(Debug)]
struct Queue {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// One bookkeeping channel.
#[derive(Debug)]
pub struct Channel {
    info: ChannelInfo,
    queue: Option<Queue>,
}

impl Channel {
    pub fn new(cid: Cid, protocol: ProtocolKind, peer: Option<SocketAddr>) -> Self {
        Self {
            info: ChannelInfo {
                cid,
                protocol,
                peer,
            },
            queue: None,
        }
    }

    /// Two in-process channels sharing `cid`, each receiving what the other sends.
    pub fn pair(cid: Cid) -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let end = |tx, rx| Channel {
            info: ChannelInfo {
                cid,
                protocol: ProtocolKind::Mpsc,
                peer: None,
            },
            queue: Some(Queue { tx, rx }),
        };
        (end(a_tx, a_rx), end(b_tx, b_rx))
    }

    pub fn cid(&self) -> Cid {
        self.info.cid
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.info.protocol
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.info.peer
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    /// Send on an in-process channel.
    ///
    /// # Errors
    /// `ParticipantDisconnected` if this channel has no queue or the other end is gone
    pub fn send(&self, data: Bytes) -> ParticipantResult<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or(ParticipantError::ParticipantDisconnected)?;
        queue
            .tx
            .send(data)
            .map_err(|_| ParticipantError::ParticipantDisconnected)
    }

    /// Receive on an in-process channel; `None` once the other end is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.queue.as_mut() {
            Some(queue) => queue.rx.recv().await,
            None => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_cross_connected() {
        let (a, mut b) = Channel::pair(3);
        assert_eq!(a.cid(), 3);
        assert_eq!(b.protocol(), ProtocolKind::Mpsc);

        a.send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"x"));

        drop(a);
        assert!(b.recv().await.is_none());
        assert!(b.send(Bytes::new()).is_err());
    }

    #[test]
    fn test_bookkeeping_channel_has_no_queue() {
        let channel = Channel::new(0, ProtocolKind::Tcp, Some("127.0.0.1:4000".parse().unwrap()));
        assert!(channel.send(Bytes::new()).is_err());
        assert_eq!(channel.peer().unwrap().port(), 4000);
    }
}
