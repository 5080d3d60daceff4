//! Guaranteed-bandwidth throttling.
//!
//! A stream opened with a non-zero `guaranteed_bandwidth` gates its unreliable
//! sends through a [`TokenBucket`] holding that many bytes. The bucket is
//! refilled to its full size once per second; it does not accumulate unused
//! budget across seconds.

use std::time::{Duration, Instant};

const REFILL_INTERVAL: Duration = Duration::from_secs(1);

/// Bytes-per-second budget, refilled in whole-second steps.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        Self::new_at(bytes_per_second, Instant::now())
    }

    fn new_at(bytes_per_second: u64, now: Instant) -> Self {
        Self {
            capacity: bytes_per_second,
            tokens: bytes_per_second,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed >= REFILL_INTERVAL {
            let periods = (elapsed.as_millis() / REFILL_INTERVAL.as_millis()) as u32;
            self.last_refill += REFILL_INTERVAL * periods;
            self.tokens = self.capacity;
        }
    }

    /// Take `bytes` from the bucket, or report how long to wait for the next refill.
    ///
    /// A message larger than the whole budget is admitted once the bucket is
    /// full, so oversized messages are slowed down but never stuck.
    pub fn try_take(&mut self, bytes: u64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if bytes <= self.tokens {
            self.tokens -= bytes;
            return Ok(());
        }
        if self.tokens == self.capacity {
            self.tokens = 0;
            return Ok(());
        }
        Err((self.last_refill + REFILL_INTERVAL).saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_per_second() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(100, start);
        assert!(bucket.try_take(60, start).is_ok());
        assert!(bucket.try_take(40, start).is_ok());
        let wait = bucket.try_take(1, start + Duration::from_millis(250)).unwrap_err();
        assert_eq!(wait, Duration::from_millis(750));

        assert!(bucket.try_take(100, start + Duration::from_secs(1)).is_ok());
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn test_unused_budget_does_not_accumulate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(10, start);
        assert!(bucket.try_take(5, start + Duration::from_secs(5)).is_ok());
        assert_eq!(bucket.available(), 5);
    }

    #[test]
    fn test_oversized_message_admitted_on_full_bucket() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(10, start);
        assert!(bucket.try_take(50, start).is_ok());
        assert!(bucket.try_take(50, start).is_err());
        assert!(bucket.try_take(50, start + Duration::from_secs(1)).is_ok());
    }
}
