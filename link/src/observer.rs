//! Hooks for watching frames move through the link.

use crate::endpoint::Identity;
use bytes::Bytes;
use std::{cell::RefCell, fmt, rc::Rc, time::SystemTime};

/// Why a frame was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reason {
    /// The endpoint is not attached to a medium.
    LinkDown,
    /// The endpoint has no alignment partner.
    Unaligned,
    /// The transmit queue rejected the frame.
    QueueFull,
    /// The receive error model flagged the frame.
    Corrupt,
    /// The context executing the destination could not be reached.
    Unreachable,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinkDown => "link_down",
            Self::Unaligned => "unaligned",
            Self::QueueFull => "queue_full",
            Self::Corrupt => "corrupt",
            Self::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives a callback for every observable step of a frame.
///
/// All methods default to doing nothing so implementations only override
/// what they care about.
pub trait Observer {
    /// A frame started occupying the wire.
    fn transmit_begin(&mut self, _time: SystemTime, _endpoint: &Identity, _frame: &Bytes) {}

    /// A frame finished occupying the wire (including the inter-frame gap).
    fn transmit_end(&mut self, _time: SystemTime, _endpoint: &Identity, _frame: &Bytes) {}

    /// A frame was accepted by the destination endpoint.
    fn receive(&mut self, _time: SystemTime, _endpoint: &Identity, _frame: &Bytes) {}

    /// A frame was discarded.
    fn dropped(&mut self, _time: SystemTime, _endpoint: &Identity, _frame: &Bytes, _reason: Reason) {
    }

    /// The endpoint went up (attached or aligned) or down (alignment lost).
    fn link_state_change(&mut self, _time: SystemTime, _endpoint: &Identity, _up: bool) {}
}

/// An [Observer] that records everything it sees, useful for tests and
/// post-run inspection.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    records: Rc<RefCell<Vec<Record>>>,
}

/// A single observation kept by a [Recorder].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    TransmitBegin { time: SystemTime, endpoint: Identity, len: usize },
    TransmitEnd { time: SystemTime, endpoint: Identity, len: usize },
    Receive { time: SystemTime, endpoint: Identity, len: usize },
    Dropped { time: SystemTime, endpoint: Identity, len: usize, reason: Reason },
    LinkState { time: SystemTime, endpoint: Identity, up: bool },
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<Record> {
        self.records.borrow().clone()
    }

    /// Drop reasons recorded so far, in order.
    pub fn drops(&self) -> Vec<Reason> {
        self.records
            .borrow()
            .iter()
            .filter_map(|record| match record {
                Record::Dropped { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }
}

impl Observer for Recorder {
    fn transmit_begin(&mut self, time: SystemTime, endpoint: &Identity, frame: &Bytes) {
        self.records.borrow_mut().push(Record::TransmitBegin {
            time,
            endpoint: *endpoint,
            len: frame.len(),
        });
    }

    fn transmit_end(&mut self, time: SystemTime, endpoint: &Identity, frame: &Bytes) {
        self.records.borrow_mut().push(Record::TransmitEnd {
            time,
            endpoint: *endpoint,
            len: frame.len(),
        });
    }

    fn receive(&mut self, time: SystemTime, endpoint: &Identity, frame: &Bytes) {
        self.records.borrow_mut().push(Record::Receive {
            time,
            endpoint: *endpoint,
            len: frame.len(),
        });
    }

    fn dropped(&mut self, time: SystemTime, endpoint: &Identity, frame: &Bytes, reason: Reason) {
        self.records.borrow_mut().push(Record::Dropped {
            time,
            endpoint: *endpoint,
            len: frame.len(),
            reason,
        });
    }

    fn link_state_change(&mut self, time: SystemTime, endpoint: &Identity, up: bool) {
        self.records.borrow_mut().push(Record::LinkState {
            time,
            endpoint: *endpoint,
            up,
        });
    }
}
