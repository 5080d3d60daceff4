//! Streams: the application-facing message pipes multiplexed over one
//! participant.
//!
//! A [`Stream`] is bound to one [`Sid`] and the [`StreamParams`] it was opened
//! with. How a message travels depends on the participant's transport:
//!
//! - **Framed** (TCP, UDP): the envelope is queued on the participant's
//!   outbound [`WaitQueue`] and split into `DataHeader`/`Data` frames by its
//!   send task. Streams with `GUARANTEED_DELIVERY` wrap every envelope in a
//!   reliable control envelope and keep it in flight until acknowledged.
//! - **In-process**: the envelope is pushed straight into the peer's inbox.
//! - **QUIC**: the envelope is written length-prefixed to the stream's own
//!   native QUIC stream.
//!
//! Ordered streams always use the stream priority so their messages stay in
//! one FIFO bucket; unordered streams may override the priority per message.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{trace, warn};

use crate::core::message::Message;
use crate::core::types::{Mid, Prio, Promises, Sid, StreamParams, LOWEST_PRIO};
use crate::error::{StreamError, StreamResult};
use crate::participant::{OutboundItem, ParticipantShared};
use crate::protocol::bandwidth::TokenBucket;
use crate::protocol::prio::WaitQueue;
use crate::protocol::reliable::{InFlight, ReceiveWindow, ReliableFrame, ReliableKind};
use crate::transport::mpsc::{Inbox, LocalFrame};
use crate::transport::quic;

/// How the messages of one stream reach the peer.
pub(crate) enum Backend {
    Framed,
    Local {
        /// The peer stream's inbox.
        remote: Inbox,
        tx: mpsc::UnboundedSender<LocalFrame>,
    },
    Quic {
        send: tokio::sync::Mutex<quinn::SendStream>,
    },
}

/// Ack/resend state of a `GUARANTEED_DELIVERY` stream.
pub(crate) struct Reliability {
    pub(crate) in_flight: InFlight,
    window: Mutex<ReceiveWindow>,
    next_mid: AtomicU64,
    close_sent: AtomicBool,
    close_acked: AtomicBool,
    close_notify: Notify,
    /// Peer close waiting for data sent before it.
    remote_close: Mutex<Option<Mid>>,
}

impl Reliability {
    fn new(window: usize, ordered: bool) -> Self {
        Self {
            in_flight: InFlight::new(window),
            window: Mutex::new(ReceiveWindow::new(ordered, window)),
            next_mid: AtomicU64::new(0),
            close_sent: AtomicBool::new(false),
            close_acked: AtomicBool::new(false),
            close_notify: Notify::new(),
            remote_close: Mutex::new(None),
        }
    }

    /// Mark a local close as sent and build its frame. `None` if a close
    /// already went out as the echo of the peer's close. A peer close still
    /// waiting for data counts as the acknowledgment of ours.
    pub(crate) fn begin_close(&self) -> Option<Bytes> {
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return None;
        }
        if self.remote_close.lock().take().is_some() {
            self.acknowledge_close();
        }
        Some(ReliableFrame::close(self.next_mid.load(Ordering::Acquire)).encode())
    }

    fn acknowledge_close(&self) {
        self.close_acked.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }

    /// Echo for a pending peer close once every id below its mid arrived.
    fn remote_close_reached(&self, next_expected: Mid) -> Option<Bytes> {
        let mut pending = self.remote_close.lock();
        match *pending {
            Some(mid) if next_expected >= mid => {
                *pending = None;
                if self.close_sent.swap(true, Ordering::AcqRel) {
                    return None;
                }
                Some(ReliableFrame::close(mid).encode())
            }
            _ => None,
        }
    }

    pub(crate) async fn wait_close_ack(&self) {
        loop {
            let notified = self.close_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.close_acked.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// What the participant has to do after a payload reached a stream.
#[derive(Debug)]
pub(crate) enum Inbound {
    Handled,
    /// Send `ack` first if present, then surface `ready`. `finish` is the
    /// close echo of a peer close that was waiting for this data.
    Data {
        ack: Option<Bytes>,
        ready: Vec<Bytes>,
        finish: Option<Bytes>,
    },
    /// The peer closed a reliable stream; send `echo` and finish the stream.
    RemoteClose { echo: Bytes },
}

/// State shared between a [`Stream`] handle and its participant.
pub(crate) struct StreamShared {
    pub(crate) sid: Sid,
    pub(crate) params: StreamParams,
    pub(crate) inbox: Inbox,
    closed: AtomicBool,
    pub(crate) reliable: Option<Reliability>,
    bucket: Option<Mutex<TokenBucket>>,
    pub(crate) backend: Backend,
}

impl StreamShared {
    pub(crate) fn new(
        sid: Sid,
        params: StreamParams,
        inbox: Inbox,
        backend: Backend,
        window: usize,
    ) -> Self {
        let framed = matches!(backend, Backend::Framed);
        let reliable = (framed && params.promises.contains(Promises::GUARANTEED_DELIVERY))
            .then(|| Reliability::new(window, params.promises.contains(Promises::ORDERED)));
        let bucket = (!matches!(backend, Backend::Local { .. }) && params.guaranteed_bandwidth > 0)
            .then(|| Mutex::new(TokenBucket::new(params.guaranteed_bandwidth)));
        Self {
            sid,
            params,
            inbox,
            closed: AtomicBool::new(false),
            reliable,
            bucket,
            backend,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed; `true` for the call that actually closed it.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Drop everything still in flight and stop accepting messages. Queued
    /// messages stay readable.
    pub(crate) fn release(&self) {
        if let Some(reliable) = &self.reliable {
            reliable.in_flight.close();
        }
        self.inbox.close();
    }

    /// Priority a message is queued with.
    fn effective_prio(&self, prio: Prio) -> Prio {
        if self.params.promises.contains(Promises::ORDERED) {
            self.params.prio
        } else {
            prio.min(LOWEST_PRIO)
        }
    }

    /// Handle one complete payload received from a framed transport.
    pub(crate) fn receive(&self, payload: Bytes) -> StreamResult<Inbound> {
        let Some(reliable) = &self.reliable else {
            return Ok(Inbound::Data {
                ack: None,
                ready: vec![payload],
                finish: None,
            });
        };
        let frame = ReliableFrame::decode(payload)?;
        match frame.kind {
            ReliableKind::Data => {
                let mut window = reliable.window.lock();
                let Some(ready) = window.accept(frame.mid, frame.payload) else {
                    trace!(sid = %self.sid, mid = frame.mid, "Message beyond the receive window");
                    return Ok(Inbound::Handled);
                };
                let finish = reliable.remote_close_reached(window.next_expected());
                Ok(Inbound::Data {
                    ack: Some(ReliableFrame::ack(frame.mid).encode()),
                    ready,
                    finish,
                })
            }
            ReliableKind::Ack => {
                if !reliable.in_flight.ack(frame.mid) {
                    trace!(sid = %self.sid, mid = frame.mid, "Duplicate ack");
                }
                Ok(Inbound::Handled)
            }
            ReliableKind::Close => {
                if reliable.close_sent.load(Ordering::Acquire) {
                    // echo of our own close, or both sides closed at once
                    reliable.acknowledge_close();
                    return Ok(Inbound::Handled);
                }
                *reliable.remote_close.lock() = Some(frame.mid);
                let next_expected = reliable.window.lock().next_expected();
                match reliable.remote_close_reached(next_expected) {
                    Some(echo) => Ok(Inbound::RemoteClose { echo }),
                    None => {
                        trace!(
                            sid = %self.sid,
                            mid = frame.mid,
                            "Peer close waits for earlier data"
                        );
                        Ok(Inbound::Handled)
                    }
                }
            }
        }
    }

    pub(crate) fn surface(&self, ready: Vec<Bytes>) {
        for payload in ready {
            self.inbox.push(self.params.prio, payload);
        }
    }

    /// Resend every reliable message whose retry interval elapsed.
    pub(crate) fn due(&self, now: Instant, retry: std::time::Duration) -> Vec<(Mid, Bytes, Prio)> {
        match &self.reliable {
            Some(reliable) => reliable.in_flight.due(now, retry),
            None => Vec::new(),
        }
    }

    async fn throttle(&self, bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        loop {
            let wait = match bucket.lock().try_take(bytes, Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            trace!(sid = %self.sid, ?wait, "Bandwidth budget exhausted");
            tokio::time::sleep(wait).await;
        }
    }
}

/// One multiplexed stream.
///
/// Dropping a stream closes it without waiting for the peer.
pub struct Stream {
    shared: Arc<StreamShared>,
    participant: Arc<ParticipantShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, participant: Arc<ParticipantShared>) -> Self {
        Self {
            shared,
            participant,
        }
    }

    pub fn sid(&self) -> Sid {
        self.shared.sid
    }

    pub fn params(&self) -> StreamParams {
        self.shared.params
    }

    pub fn promises(&self) -> Promises {
        self.shared.params.promises
    }

    /// Serialize and send `value` at the stream priority.
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> StreamResult<()> {
        self.send_with_prio(value, self.shared.params.prio).await
    }

    /// Serialize and send `value` with a per-message priority. Ordered
    /// streams ignore `prio`.
    pub async fn send_with_prio<T: Serialize + ?Sized>(
        &self,
        value: &T,
        prio: Prio,
    ) -> StreamResult<()> {
        let message = Message::serialize(value, &self.shared.params)?;
        self.send_raw_with_prio(&message, prio).await
    }

    pub async fn send_raw(&self, message: &Message) -> StreamResult<()> {
        self.send_raw_with_prio(message, self.shared.params.prio).await
    }

    /// Send an already serialized message.
    ///
    /// # Errors
    /// `StreamClosed` once either side closed the stream or the participant
    /// disconnected, `MessageTooLarge` above the configured message size
    pub async fn send_raw_with_prio(&self, message: &Message, prio: Prio) -> StreamResult<()> {
        if self.shared.is_closed() {
            return Err(StreamError::StreamClosed);
        }
        if !message.verify(&self.shared.params) {
            warn!(sid = %self.shared.sid, "Message compression does not match the stream promises");
        }
        let envelope = message.to_envelope();
        let max = self.participant.max_message_size();
        if envelope.len() > max {
            return Err(StreamError::MessageTooLarge {
                len: envelope.len(),
                max,
            });
        }
        let len = envelope.len() as u64;
        let prio = self.shared.effective_prio(prio);
        let sid = self.shared.sid;

        match &self.shared.backend {
            Backend::Local { remote, .. } => {
                if !remote.push(prio, envelope) {
                    return Err(StreamError::StreamClosed);
                }
            }
            Backend::Quic { send } => {
                self.shared.throttle(len).await;
                let mut send = send.lock().await;
                quic::write_message(&mut send, &envelope)
                    .await
                    .map_err(|_| StreamError::StreamClosed)?;
            }
            Backend::Framed => {
                self.shared.throttle(len).await;
                let payload = match &self.shared.reliable {
                    Some(reliable) => {
                        let permit = reliable.in_flight.admit().await?;
                        let mid = reliable.next_mid.fetch_add(1, Ordering::AcqRel);
                        let encoded = ReliableFrame::data(mid, envelope).encode();
                        reliable
                            .in_flight
                            .track(mid, encoded.clone(), prio, permit, Instant::now());
                        encoded
                    }
                    None => envelope,
                };
                if !self
                    .participant
                    .enqueue(prio, OutboundItem::Message { sid, payload })
                {
                    return Err(StreamError::StreamClosed);
                }
            }
        }
        self.participant.record_sent(len);
        Ok(())
    }

    /// Wait for the next message and deserialize it.
    pub async fn recv<T: DeserializeOwned>(&self) -> StreamResult<T> {
        self.recv_raw().await?.deserialize()
    }

    /// Wait for the next message.
    ///
    /// # Errors
    /// `StreamClosed` once the stream is closed and every queued message was read
    pub async fn recv_raw(&self) -> StreamResult<Message> {
        let envelope = self
            .shared
            .inbox
            .pop()
            .await
            .ok_or(StreamError::StreamClosed)?;
        self.open_envelope(envelope)
    }

    /// Next message if one is queued.
    pub fn try_recv<T: DeserializeOwned>(&self) -> StreamResult<Option<T>> {
        self.try_recv_raw()?.map(|m| m.deserialize()).transpose()
    }

    pub fn try_recv_raw(&self) -> StreamResult<Option<Message>> {
        match self.shared.inbox.try_pop() {
            Some(envelope) => self.open_envelope(envelope).map(Some),
            None if self.shared.inbox.is_closed() => Err(StreamError::StreamClosed),
            None => Ok(None),
        }
    }

    fn open_envelope(&self, envelope: Bytes) -> StreamResult<Message> {
        // in-process peers push straight into the inbox, the other transports
        // count on arrival
        if matches!(self.shared.backend, Backend::Local { .. }) {
            self.participant.record_received(envelope.len() as u64);
        }
        Message::from_envelope(
            envelope,
            self.shared.params.promises.contains(Promises::COMPRESSED),
        )
    }

    /// Close the stream for both directions.
    ///
    /// A reliable stream first waits for its messages in flight to be
    /// acknowledged, then for the peer to acknowledge the close, each bounded
    /// by the configured close timeout. Closing twice is a no-op.
    pub async fn close(&self) {
        self.participant.close_stream(&self.shared, true).await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Reliable messages sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.shared
            .reliable
            .as_ref()
            .map_or(0, |r| r.in_flight.len())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("sid", &self.shared.sid)
            .field("params", &self.shared.params)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            self.participant.dispose_stream(&self.shared);
        }
    }
}

/// An in-process inbox.
pub(crate) fn new_inbox() -> Inbox {
    Arc::new(WaitQueue::new())
}
