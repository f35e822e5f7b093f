//! # Session History Buffer
//!
//! A fixed-capacity byte ring that keeps the most recent output of a terminal
//! session so that viewers who attach late can be replayed what they missed.
//!
//! ```text
//!   backing storage (capacity C)
//!   ┌───────────────────────────────────────────┐
//!   │ newest ▸▸▸▸ │  (free)  │ oldest ▸▸▸▸▸▸▸▸▸ │
//!   └───────────────────────────────────────────┘
//!                             ▲ start
//! ```
//!
//! The backing storage is allocated once and never grows. When an append
//! does not fit in the free region the logical start advances and the oldest
//! bytes are overwritten.

/// Default history capacity per session: 512 KiB.
pub const HISTORY_CAPACITY: usize = 512 * 1024;

/// Fixed-capacity ring of output bytes.
///
/// The buffer itself is not synchronized. A [`TerminalSession`] keeps it
/// behind its state mutex, so a [`snapshot`](HistoryBuffer::snapshot) is
/// always a copy of a fully applied append.
///
/// [`TerminalSession`]: crate::session::TerminalSession
#[derive(Debug)]
pub struct HistoryBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl HistoryBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be > 0");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    /// Appends a chunk, evicting the oldest bytes when the ring is full.
    ///
    /// A chunk at least as large as the capacity replaces the whole contents
    /// with its trailing `capacity` bytes.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let cap = self.buf.len();
        if data.len() >= cap {
            self.buf.copy_from_slice(&data[data.len() - cap..]);
            self.start = 0;
            self.len = cap;
            return;
        }

        let free = cap - self.len;
        if data.len() > free {
            self.start = (self.start + (data.len() - free)) % cap;
            self.len = cap;
        } else {
            self.len += data.len();
        }

        let write_pos = (self.start + self.len - data.len()) % cap;
        let first = data.len().min(cap - write_pos);
        self.buf[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
    }

    /// Returns the buffered bytes, oldest first, as one contiguous copy.
    pub fn snapshot(&self) -> Vec<u8> {
        let cap = self.buf.len();
        if self.start + self.len <= cap {
            return self.buf[self.start..self.start + self.len].to_vec();
        }

        let wrapped = self.start + self.len - cap;
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(&self.buf[self.start..]);
        out.extend_from_slice(&self.buf[..wrapped]);
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}
