//! Acknowledged delivery for streams opened with `GUARANTEED_DELIVERY`.
//!
//! Every reliable payload travels inside a small control envelope:
//!
//! ```text
//! kind(u8) || message_id(u64 LE) || [payload]
//! kind: 0x01 data, 0x02 ack, 0x03 close
//! ```
//!
//! The sender keeps each data message in its [`InFlight`] set until the ack for
//! its id arrives, sending it again every retry interval. The number of
//! unacknowledged messages is bounded by a semaphore-backed window. The receiver
//! acks every data message, including duplicates, and uses a [`ReceiveWindow`]
//! to drop duplicates and restore order when the stream is ordered. Ids more
//! than one window ahead of the oldest missing id are dropped unacknowledged;
//! the sender never has that many in flight, so only a misbehaving peer hits it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::core::types::{Mid, Prio};
use crate::error::{constants, StreamError, StreamResult};

pub const KIND_DATA: u8 = 0x01;
pub const KIND_ACK: u8 = 0x02;
pub const KIND_CLOSE: u8 = 0x03;

/// Bytes a reliable envelope adds in front of the payload.
pub const HEADER_LEN: usize = 1 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableKind {
    Data,
    Ack,
    Close,
}

impl ReliableKind {
    fn tag(self) -> u8 {
        match self {
            ReliableKind::Data => KIND_DATA,
            ReliableKind::Ack => KIND_ACK,
            ReliableKind::Close => KIND_CLOSE,
        }
    }
}

/// One decoded reliable control envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableFrame {
    pub kind: ReliableKind,
    pub mid: Mid,
    pub payload: Bytes,
}

impl ReliableFrame {
    pub fn data(mid: Mid, payload: Bytes) -> Self {
        Self {
            kind: ReliableKind::Data,
            mid,
            payload,
        }
    }

    pub fn ack(mid: Mid) -> Self {
        Self {
            kind: ReliableKind::Ack,
            mid,
            payload: Bytes::new(),
        }
    }

    pub fn close(mid: Mid) -> Self {
        Self {
            kind: ReliableKind::Close,
            mid,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.tag());
        buf.put_u64_le(self.mid);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> StreamResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(StreamError::InvalidEnvelope(constants::ERR_RELIABLE_HEADER));
        }
        let kind = match bytes.get_u8() {
            KIND_DATA => ReliableKind::Data,
            KIND_ACK => ReliableKind::Ack,
            KIND_CLOSE => ReliableKind::Close,
            _ => return Err(StreamError::InvalidEnvelope(constants::ERR_RELIABLE_KIND)),
        };
        let mid = bytes.get_u64_le();
        Ok(Self {
            kind,
            mid,
            payload: bytes,
        })
    }
}

#[derive(Debug)]
struct Pending {
    encoded: Bytes,
    prio: Prio,
    last_sent: Instant,
    // returned to the window when the entry is dropped
    _permit: OwnedSemaphorePermit,
}

/// Messages sent but not yet acknowledged.
#[derive(Debug)]
pub struct InFlight {
    window: Arc<Semaphore>,
    capacity: usize,
    pending: Mutex<BTreeMap<Mid, Pending>>,
    drained: Notify,
}

impl InFlight {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Arc::new(Semaphore::new(capacity)),
            capacity,
            pending: Mutex::new(BTreeMap::new()),
            drained: Notify::new(),
        }
    }

    /// Wait for a free window slot.
    ///
    /// # Errors
    /// Returns `StreamError::StreamClosed` once [`InFlight::close`] was called
    pub async fn admit(&self) -> StreamResult<OwnedSemaphorePermit> {
        self.window
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StreamError::StreamClosed)
    }

    /// Remember a sent message until it is acknowledged.
    pub fn track(
        &self,
        mid: Mid,
        encoded: Bytes,
        prio: Prio,
        permit: OwnedSemaphorePermit,
        now: Instant,
    ) {
        self.pending.lock().insert(
            mid,
            Pending {
                encoded,
                prio,
                last_sent: now,
                _permit: permit,
            },
        );
    }

    /// Clear an acknowledged message. Duplicate acks are ignored.
    pub fn ack(&self, mid: Mid) -> bool {
        let mut pending = self.pending.lock();
        let removed = pending.remove(&mid).is_some();
        if removed && pending.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Resolves once every tracked message has been acknowledged.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Messages whose last send is at least `retry_interval` old; their send
    /// time is reset to `now`.
    pub fn due(&self, now: Instant, retry_interval: Duration) -> Vec<(Mid, Bytes, Prio)> {
        let mut pending = self.pending.lock();
        pending
            .iter_mut()
            .filter(|(_, p)| now.saturating_duration_since(p.last_sent) >= retry_interval)
            .map(|(mid, p)| {
                p.last_sent = now;
                (*mid, p.encoded.clone(), p.prio)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Free window slots.
    pub fn available(&self) -> usize {
        self.window.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Abandon everything in flight and fail pending and future `admit` calls.
    pub fn close(&self) {
        self.window.close();
        self.pending.lock().clear();
        self.drained.notify_waiters();
    }
}

/// Receive-side duplicate suppression and reordering.
#[derive(Debug)]
pub struct ReceiveWindow {
    ordered: bool,
    capacity: Mid,
    next_expected: Mid,
    buffered: BTreeMap<Mid, Bytes>,
    delivered_ahead: BTreeSet<Mid>,
}

impl ReceiveWindow {
    pub fn new(ordered: bool, capacity: usize) -> Self {
        Self {
            ordered,
            capacity: capacity.max(1) as Mid,
            next_expected: 0,
            buffered: BTreeMap::new(),
            delivered_ahead: BTreeSet::new(),
        }
    }

    /// Accept one data message; returns the payloads that can be surfaced now,
    /// or `None` when `mid` lies beyond the window and must not be acked.
    pub fn accept(&mut self, mid: Mid, payload: Bytes) -> Option<Vec<Bytes>> {
        if mid < self.next_expected {
            return Some(Vec::new());
        }
        if mid - self.next_expected >= self.capacity {
            return None;
        }
        Some(self.admit(mid, payload))
    }

    fn admit(&mut self, mid: Mid, payload: Bytes) -> Vec<Bytes> {
        if self.ordered {
            if mid != self.next_expected {
                self.buffered.entry(mid).or_insert(payload);
                return Vec::new();
            }
            let mut ready = vec![payload];
            self.next_expected += 1;
            while let Some(next) = self.buffered.remove(&self.next_expected) {
                ready.push(next);
                self.next_expected += 1;
            }
            ready
        } else {
            if mid != self.next_expected {
                if !self.delivered_ahead.insert(mid) {
                    return Vec::new();
                }
                return vec![payload];
            }
            self.next_expected += 1;
            while self.delivered_ahead.remove(&self.next_expected) {
                self.next_expected += 1;
            }
            vec![payload]
        }
    }

    /// Messages held back waiting for an earlier id.
    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Lowest id not yet received. Every id below it has been surfaced.
    pub fn next_expected(&self) -> Mid {
        self.next_expected
    }
}
