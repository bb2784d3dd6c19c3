//! Bounded drop-tail transmit queue.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

/// Admission limit of a [Queue].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    /// At most this many frames.
    Packets(usize),
    /// At most this many bytes.
    Bytes(usize),
}

impl Default for Limit {
    fn default() -> Self {
        Self::Packets(100)
    }
}

/// A frame waiting to be transmitted.
#[derive(Clone, Debug)]
pub struct Entry {
    pub frame: Bytes,
    pub size: usize,
}

/// FIFO of encoded frames that rejects (drops) frames which would exceed its
/// [Limit].
#[derive(Debug)]
pub struct Queue {
    limit: Limit,
    entries: VecDeque<Entry>,
    bytes: usize,

    enqueued: u64,
    dequeued: u64,
    dropped: u64,
}

impl Queue {
    pub fn new(limit: Limit) -> Self {
        Self {
            limit,
            entries: VecDeque::new(),
            bytes: 0,
            enqueued: 0,
            dequeued: 0,
            dropped: 0,
        }
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// Append `frame` to the tail.
    ///
    /// Returns the frame back if admitting it would exceed the limit.
    pub fn enqueue(&mut self, frame: Bytes) -> Result<(), Bytes> {
        let size = frame.len();
        let admitted = match self.limit {
            Limit::Packets(max) => self.entries.len() < max,
            Limit::Bytes(max) => self.bytes + size <= max,
        };
        if !admitted {
            self.dropped += 1;
            trace!(
                packets = self.entries.len(),
                bytes = self.bytes,
                size,
                "queue full"
            );
            return Err(frame);
        }
        self.bytes += size;
        self.enqueued += 1;
        self.entries.push_back(Entry { frame, size });
        Ok(())
    }

    /// Remove the frame at the head.
    pub fn dequeue(&mut self) -> Option<Bytes> {
        let entry = self.entries.pop_front()?;
        self.bytes -= entry.size;
        self.dequeued += 1;
        Some(entry.frame)
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of queued bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Returns true if no further frame can be admitted, assuming frames of
    /// up to `mtu` bytes.
    pub fn is_full(&self, mtu: usize) -> bool {
        !self.has_room(mtu)
    }

    /// Returns true if one more frame of up to `mtu` bytes fits.
    pub fn has_room(&self, mtu: usize) -> bool {
        match self.limit {
            Limit::Packets(max) => self.entries.len() < max,
            Limit::Bytes(max) => self.bytes + mtu <= max,
        }
    }

    /// Lifetime totals: `(enqueued, dequeued, dropped)`.
    pub fn totals(&self) -> (u64, u64, u64) {
        (self.enqueued, self.dequeued, self.dropped)
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(Limit::default())
    }
}
