//! Per-connection token bucket for viewer input.
//!
//! Each connection owns its own bucket, so one viewer flooding a session
//! cannot use up the input budget of the other viewers on it. Refill is
//! computed from the elapsed time whenever the bucket is consulted; there is
//! no background timer.

use std::time::Instant;

/// Default bucket capacity in bytes.
pub const DEFAULT_CAPACITY: u32 = 4096;
/// Default refill rate in bytes per second.
pub const DEFAULT_REFILL_PER_SEC: f64 = 4096.0;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// - `capacity`: maximum burst in bytes
    /// - `refill_per_sec`: bytes added back per second
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self::starting_at(capacity, refill_per_sec, Instant::now())
    }

    fn starting_at(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            last_refill: now,
        }
    }

    /// Tries to take `n` tokens. Returns `true` if admitted.
    ///
    /// A rejected request leaves the bucket untouched; the caller drops the
    /// input rather than queueing it.
    pub fn try_take(&mut self, n: usize) -> bool {
        self.try_take_at(n, Instant::now())
    }

    fn try_take_at(&mut self, n: usize, now: Instant) -> bool {
        self.refill(now);

        let wanted = n as f64;
        if self.tokens >= wanted {
            self.tokens -= wanted;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Tokens currently available, without refilling.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC)
    }
}
