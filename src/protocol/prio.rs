//! Weighted round-robin over eight priority buckets.
//!
//! [`PrioQueue`] decides what leaves next: outbound messages of a participant,
//! messages waiting in a stream's inbox, and remotely opened streams waiting to
//! be accepted. Bucket 0 is the highest priority.
//!
//! Each poll serves the highest non-empty bucket that still has credit and
//! charges one credit. When every non-empty bucket has run out, all credits are
//! reset to [`BUCKET_WEIGHTS`]. With the default weights bucket 0 gets at most
//! eight dequeues in a row while lower buckets wait, so nothing starves.
//!
//! [`WaitQueue`] wraps a [`PrioQueue`] for async consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::types::{Prio, LOWEST_PRIO, PRIO_BUCKETS};

/// Credits handed to each bucket per round.
pub const BUCKET_WEIGHTS: [u32; PRIO_BUCKETS] = [8, 4, 2, 1, 1, 1, 1, 1];

/// FIFO-within-bucket priority queue.
#[derive(Debug)]
pub struct PrioQueue<T> {
    buckets: [VecDeque<T>; PRIO_BUCKETS],
    credits: [u32; PRIO_BUCKETS],
    idle_cursor: usize,
    len: usize,
}

impl<T> PrioQueue<T> {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            credits: BUCKET_WEIGHTS,
            idle_cursor: 0,
            len: 0,
        }
    }

    /// Queue `item`; priorities past the lowest bucket are clamped.
    pub fn push(&mut self, prio: Prio, item: T) {
        let bucket = prio.min(LOWEST_PRIO) as usize;
        self.buckets[bucket].push_back(item);
        self.len += 1;
    }

    /// Next item by weighted round-robin, `None` when nothing is queued.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            // idle: refill one bucket per poll
            self.credits[self.idle_cursor] = BUCKET_WEIGHTS[self.idle_cursor];
            self.idle_cursor = (self.idle_cursor + 1) % PRIO_BUCKETS;
            return None;
        }

        let bucket = match self.next_bucket() {
            Some(bucket) => bucket,
            None => {
                self.credits = BUCKET_WEIGHTS;
                self.next_bucket()?
            }
        };
        self.credits[bucket] -= 1;
        self.len -= 1;
        self.buckets[bucket].pop_front()
    }

    fn next_bucket(&self) -> Option<usize> {
        (0..PRIO_BUCKETS).find(|&b| !self.buckets[b].is_empty() && self.credits[b] > 0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove everything, in priority order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for bucket in self.buckets.iter_mut() {
            out.extend(bucket.drain(..));
        }
        self.len = 0;
        out
    }
}

impl<T> Default for PrioQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// [`PrioQueue`] with an async `pop`, plus an unweighted lane that is always
/// served first (control frames that must overtake queued data).
#[derive(Debug)]
pub struct WaitQueue<T> {
    inner: Mutex<Lanes<T>>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Debug)]
struct Lanes<T> {
    urgent: VecDeque<T>,
    queue: PrioQueue<T>,
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Lanes {
                urgent: VecDeque::new(),
                queue: PrioQueue::new(),
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an item; returns `false` (dropping the item) once closed.
    pub fn push(&self, prio: Prio, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.lock().queue.push(prio, item);
        self.notify.notify_one();
        true
    }

    /// Queue an item ahead of everything in the weighted buckets.
    pub fn push_urgent(&self, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.lock().urgent.push_back(item);
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut lanes = self.inner.lock();
        match lanes.urgent.pop_front() {
            Some(item) => Some(item),
            None => lanes.queue.pop(),
        }
    }

    /// Wait for the next item. Queued items are still handed out after
    /// [`WaitQueue::close`]; `None` means closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting items and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let lanes = self.inner.lock();
        lanes.urgent.len() + lanes.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every queued item.
    pub fn drain(&self) -> Vec<T> {
        let mut lanes = self.inner.lock();
        let mut out: Vec<T> = lanes.urgent.drain(..).collect();
        out.extend(lanes.queue.drain());
        out
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
