//! One link interface on a node.
//!
//! An endpoint owns its transmit queue and a two-state transmit machine:
//!
//! ```text
//!            begin()                 complete()
//!   Ready ------------> Busy ----------------------> Ready
//!                        ^                            |
//!                        +---- begin(next frame) <----+ (queue not empty)
//! ```
//!
//! The endpoint itself never touches the scheduler or the medium: the
//! [crate::Simulation] drives it and acts on what each step returns.

use crate::{
    config::{DataRate, DeviceConfig},
    error_model::Corruption,
    frame::{self, Address},
    queue::{Limit, Queue},
    simulation::Event,
    NodeId,
};
use beamlink_scheduler::deterministic::Scheduler;
use bytes::Bytes;
use std::{cell::RefCell, fmt, rc::Rc, time::Duration};
use tracing::{debug, trace};

/// Index of an endpoint on its medium.
pub type EndpointId = usize;

/// Who an endpoint is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    /// Node the endpoint belongs to.
    pub node: NodeId,
    /// Position of the endpoint among the node's interfaces.
    pub interface: u32,
    pub address: Address,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.node, self.interface, self.address)
    }
}

/// State of the transmit machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing on the wire.
    Ready,
    /// A frame is on the wire (or in the inter-frame gap after it).
    Busy,
}

/// Flow control between an endpoint and the layer feeding it.
pub trait Backpressure {
    /// Ask the upper layer to stop handing over frames.
    fn stop(&mut self);
    /// Let the upper layer hand over frames again.
    fn start(&mut self);
    /// Let the upper layer hand over frames again and tell it the device is
    /// idle.
    fn wake(&mut self);
    fn is_stopped(&self) -> bool;
    fn notify_queued_bytes(&mut self, bytes: usize);
    fn notify_transmitted_bytes(&mut self, bytes: usize);
}

/// Counters kept by a [Flow].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowState {
    pub stopped: bool,
    pub stops: u64,
    pub starts: u64,
    pub wakes: u64,
    pub queued_bytes: u64,
    pub transmitted_bytes: u64,
}

/// A shareable [Backpressure] handle: the endpoint holds one clone and the
/// upper layer keeps another to check whether it may send.
#[derive(Clone, Debug, Default)]
pub struct Flow {
    state: Rc<RefCell<FlowState>>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FlowState {
        self.state.borrow().clone()
    }
}

impl Backpressure for Flow {
    fn stop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.stopped = true;
        state.stops += 1;
    }

    fn start(&mut self) {
        let mut state = self.state.borrow_mut();
        state.stopped = false;
        state.starts += 1;
    }

    fn wake(&mut self) {
        let mut state = self.state.borrow_mut();
        state.stopped = false;
        state.wakes += 1;
    }

    fn is_stopped(&self) -> bool {
        self.state.borrow().stopped
    }

    fn notify_queued_bytes(&mut self, bytes: usize) {
        self.state.borrow_mut().queued_bytes += bytes as u64;
    }

    fn notify_transmitted_bytes(&mut self, bytes: usize) {
        self.state.borrow_mut().transmitted_bytes += bytes as u64;
    }
}

/// A frame handed to the upper layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    /// Endpoint that accepted the frame.
    pub endpoint: Identity,
    pub ethertype: u16,
    pub source: Address,
    pub destination: Address,
    pub payload: Bytes,
}

/// Upper-layer hook invoked for every accepted frame. The scheduler is
/// passed along so the hook can schedule replies.
pub type ReceiveCallback = Box<dyn FnMut(&mut Scheduler<Event>, &Received)>;

/// Outcome of handing a frame to [Endpoint::admit].
#[derive(Debug)]
pub(crate) enum Admission {
    /// The queue rejected the frame.
    Dropped(Bytes),
    /// The frame waits behind the one on the wire.
    Queued,
    /// The endpoint was idle: this frame (the queue head) must go on the wire.
    Transmit(Bytes),
}

/// A link interface: transmit machine, queue and upper-layer hooks.
pub struct Endpoint {
    identity: Identity,
    device: DeviceConfig,
    state: State,
    current: Option<Bytes>,
    queue: Queue,
    link_up: bool,

    corruption: Option<Box<dyn Corruption>>,
    backpressure: Option<Box<dyn Backpressure>>,
    pub(crate) on_receive: Option<ReceiveCallback>,
    pub(crate) on_promiscuous: Option<ReceiveCallback>,
}

impl Endpoint {
    pub fn new(identity: Identity, device: DeviceConfig, queue: Queue) -> Self {
        Self {
            identity,
            device,
            state: State::Ready,
            current: None,
            queue,
            link_up: false,
            corruption: None,
            backpressure: None,
            on_receive: None,
            on_promiscuous: None,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn node(&self) -> NodeId {
        self.identity.node
    }

    pub fn interface(&self) -> u32 {
        self.identity.interface
    }

    pub fn address(&self) -> Address {
        self.identity.address
    }

    pub fn set_address(&mut self, address: Address) {
        self.identity.address = address;
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Frame currently on the wire.
    pub fn in_flight(&self) -> Option<&Bytes> {
        self.current.as_ref()
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn mtu(&self) -> u16 {
        self.device.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.device.mtu = mtu;
    }

    pub fn data_rate(&self) -> DataRate {
        self.device.data_rate
    }

    pub fn set_data_rate(&mut self, rate: DataRate) {
        self.device.data_rate = rate;
    }

    pub fn interframe_gap(&self) -> Duration {
        self.device.interframe_gap
    }

    pub fn set_interframe_gap(&mut self, gap: Duration) {
        self.device.interframe_gap = gap;
    }

    pub fn set_corruption(&mut self, corruption: Option<Box<dyn Corruption>>) {
        self.corruption = corruption;
    }

    pub fn set_backpressure(&mut self, backpressure: Box<dyn Backpressure>) {
        self.backpressure = Some(backpressure);
    }

    pub fn set_receive_callback(&mut self, callback: ReceiveCallback) {
        self.on_receive = Some(callback);
    }

    pub fn set_promiscuous_callback(&mut self, callback: ReceiveCallback) {
        self.on_promiscuous = Some(callback);
    }

    pub fn is_point_to_point(&self) -> bool {
        true
    }

    pub fn is_broadcast(&self) -> bool {
        true
    }

    pub fn is_multicast(&self) -> bool {
        true
    }

    /// Peers are reachable without address resolution.
    pub fn needs_arp(&self) -> bool {
        false
    }

    /// Sending with a spoofed source address is not supported.
    pub fn supports_send_from(&self) -> bool {
        false
    }

    pub(crate) fn mark_link_up(&mut self) {
        self.link_up = true;
    }

    fn mtu_bytes(&self) -> usize {
        self.device.mtu as usize
    }

    /// Enqueue an encoded frame and, if idle, pull the queue head for
    /// transmission.
    pub(crate) fn admit(&mut self, frame: Bytes) -> Admission {
        let size = frame.len();
        if let Err(frame) = self.queue.enqueue(frame) {
            debug!(endpoint = %self.identity, size, "transmit queue full");
            if let Some(backpressure) = self.backpressure.as_mut() {
                backpressure.stop();
            }
            return Admission::Dropped(frame);
        }
        let mtu = self.mtu_bytes();
        let full = self.queue.is_full(mtu);
        let limit = self.queue.limit();
        if let Some(backpressure) = self.backpressure.as_mut() {
            backpressure.notify_queued_bytes(size);
        }
        match self.state {
            State::Ready => {
                let Some(head) = self.queue.dequeue() else {
                    panic!("queue empty right after enqueue");
                };

                // A byte-limited queue may lack room for a full MTU even when
                // it is not full.
                let no_room = matches!(limit, Limit::Bytes(_)) && !self.queue.has_room(mtu);
                if no_room {
                    if let Some(backpressure) = self.backpressure.as_mut() {
                        debug!(
                            endpoint = %self.identity,
                            packets = self.queue.len(),
                            bytes = self.queue.bytes(),
                            "stopping upper layer"
                        );
                        backpressure.stop();
                    }
                }
                Admission::Transmit(head)
            }
            State::Busy => {
                if full {
                    if let Some(backpressure) = self.backpressure.as_mut() {
                        debug!(
                            endpoint = %self.identity,
                            packets = self.queue.len(),
                            bytes = self.queue.bytes(),
                            "stopping upper layer"
                        );
                        backpressure.stop();
                    }
                }
                Admission::Queued
            }
        }
    }

    /// Put `frame` on the wire and return how long it occupies it (excluding
    /// the inter-frame gap).
    ///
    /// Panics if a frame is already on the wire.
    pub(crate) fn begin(&mut self, frame: Bytes) -> Duration {
        assert_eq!(
            self.state,
            State::Ready,
            "transmit started while busy on {}",
            self.identity
        );
        self.state = State::Busy;
        let tx_time = self.device.data_rate.transmit_time(frame.len());
        trace!(endpoint = %self.identity, size = frame.len(), ?tx_time, "transmit start");
        self.current = Some(frame);
        tx_time
    }

    /// Report the in-flight frame to backpressure accounting.
    pub(crate) fn transmitted(&mut self) {
        let Some(size) = self.current.as_ref().map(Bytes::len) else {
            return;
        };
        if let Some(backpressure) = self.backpressure.as_mut() {
            backpressure.notify_transmitted_bytes(size);
        }
    }

    /// Take the finished frame off the wire and pull the next one, if any.
    ///
    /// Panics if nothing is on the wire.
    pub(crate) fn complete(&mut self) -> (Bytes, Option<Bytes>) {
        assert_eq!(
            self.state,
            State::Busy,
            "transmit completed while ready on {}",
            self.identity
        );
        self.state = State::Ready;
        let Some(finished) = self.current.take() else {
            panic!("no frame in flight on {}", self.identity);
        };

        let Some(next) = self.queue.dequeue() else {
            trace!(endpoint = %self.identity, "transmit queue drained");
            if let Some(backpressure) = self.backpressure.as_mut() {
                backpressure.wake();
            }
            return (finished, None);
        };
        let room = self.queue.has_room(self.mtu_bytes());
        if let Some(backpressure) = self.backpressure.as_mut() {
            if backpressure.is_stopped() && room {
                debug!(
                    endpoint = %self.identity,
                    packets = self.queue.len(),
                    bytes = self.queue.bytes(),
                    "starting upper layer"
                );
                backpressure.start();
            }
        }
        (finished, Some(next))
    }

    /// Run the corruption check and strip the header.
    ///
    /// Returns `None` if the frame must be dropped as corrupt.
    pub(crate) fn accept(&mut self, frame: &Bytes) -> Option<Received> {
        if let Some(corruption) = self.corruption.as_mut() {
            if corruption.is_corrupt(frame) {
                return None;
            }
        }
        let decapsulated = frame::decapsulate(frame.clone());
        Some(Received {
            endpoint: self.identity,
            ethertype: decapsulated.ethertype,
            source: decapsulated.source,
            destination: decapsulated.destination,
            payload: decapsulated.payload,
        })
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("link_up", &self.link_up)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
