//! Delivery of transmitted frames to their destination context.
//!
//! A frame whose destination node is executed by this context becomes an
//! arrival event on the local scheduler. Otherwise it is wrapped in a
//! [Remote] message and handed to a [Transport]; the receiving context
//! schedules the arrival at exactly the instant computed by the sender, so
//! both paths observe the same timing.

use crate::{
    endpoint::EndpointId,
    frame::MAX_FRAME_LEN,
    simulation::Event,
    NodeId,
};
use beamlink_scheduler::{deterministic::Scheduler, Clock};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt as _, Write};
use commonware_utils::SystemTimeExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error as ThisError;
use tracing::{debug, trace};

/// Largest frame a [Remote] message may carry.
///
/// Every frame built by [crate::frame::encapsulate] fits.
pub const MAX_REMOTE_FRAME: usize = MAX_FRAME_LEN;

/// Identifier of a simulation context.
pub type System = u32;

/// A frame in transit to another context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remote {
    /// Destination node.
    pub node: NodeId,
    /// Interface index of the destination endpoint on its node.
    pub interface: u32,
    /// Absolute arrival time.
    pub arrival: SystemTime,
    /// Encoded frame.
    pub frame: Bytes,
}

impl Write for Remote {
    fn write(&self, buf: &mut impl BufMut) {
        self.node.write(buf);
        self.interface.write(buf);
        let nanos = u64::try_from(self.arrival.epoch().as_nanos()).unwrap_or(u64::MAX);
        nanos.write(buf);
        (self.frame.len() as u32).write(buf);
        buf.put_slice(&self.frame);
    }
}

impl EncodeSize for Remote {
    fn encode_size(&self) -> usize {
        u32::SIZE * 3 + u64::SIZE + self.frame.len()
    }
}

impl Read for Remote {
    /// Largest frame accepted.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_frame: &usize) -> Result<Self, Error> {
        let node = u32::read(buf)?;
        let interface = u32::read(buf)?;
        let arrival = UNIX_EPOCH + Duration::from_nanos(u64::read(buf)?);
        let len = u32::read(buf)? as usize;
        if len > *max_frame {
            return Err(Error::InvalidLength(len));
        }
        if buf.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        let frame = buf.copy_to_bytes(len);
        Ok(Self {
            node,
            interface,
            arrival,
            frame,
        })
    }
}

/// A [Transport] could not reach the context executing the destination.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[error("context {0} is unreachable")]
pub struct Unreachable(pub System);

/// Carries [Remote] messages to other contexts.
pub trait Transport {
    /// Hand `message` to the context executing `system`.
    ///
    /// Returns [Unreachable] if that context no longer accepts messages.
    fn send(&mut self, system: System, message: Remote) -> Result<(), Unreachable>;
}

/// Where a transmitted frame has to go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Destination {
    pub endpoint: EndpointId,
    pub node: NodeId,
    pub interface: u32,
    /// Context executing `node`.
    pub system: System,
}

/// How a frame was delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote,
    /// The transport could not reach the destination context.
    Unreachable,
}

/// Chooses between local scheduling and the transport.
pub enum Router {
    /// Every node runs in this context.
    Local,
    /// This context executes `system`; frames for other contexts go through
    /// `transport`.
    Distributed {
        system: System,
        transport: Box<dyn Transport>,
    },
}

impl Router {
    pub fn distributed(system: System, transport: Box<dyn Transport>) -> Self {
        Self::Distributed { system, transport }
    }

    /// Context executed by this router.
    pub fn system(&self) -> System {
        match self {
            Self::Local => 0,
            Self::Distributed { system, .. } => *system,
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed { .. })
    }

    /// Deliver `frame` to `destination` at `arrival`.
    ///
    /// Panics if the destination lives in another context and there is no
    /// transport, if a remote arrival would land inside the lookahead window
    /// of the receiving context, or if `frame` exceeds [MAX_REMOTE_FRAME].
    pub(crate) fn deliver(
        &mut self,
        scheduler: &mut Scheduler<Event>,
        destination: Destination,
        frame: Bytes,
        arrival: SystemTime,
        lookahead: Duration,
    ) -> Route {
        let local = self.system();
        if destination.system == local {
            trace!(
                node = destination.node,
                interface = destination.interface,
                arrival = ?arrival.epoch(),
                "scheduling local arrival"
            );
            scheduler.schedule_at(
                arrival,
                Some(destination.node),
                Event::Arrival {
                    endpoint: destination.endpoint,
                    frame,
                },
            );
            return Route::Local;
        }

        let Self::Distributed { transport, .. } = self else {
            panic!(
                "node {} runs in context {} but there is no transport",
                destination.node, destination.system
            );
        };
        assert!(
            frame.len() <= MAX_REMOTE_FRAME,
            "frame of {} bytes exceeds the remote limit of {MAX_REMOTE_FRAME} bytes",
            frame.len()
        );
        let earliest = scheduler.current() + lookahead;
        assert!(
            arrival >= earliest,
            "remote arrival at {:?} is inside the lookahead window (earliest {:?})",
            arrival.epoch(),
            earliest.epoch()
        );
        trace!(
            node = destination.node,
            interface = destination.interface,
            system = destination.system,
            arrival = ?arrival.epoch(),
            "sending to remote context"
        );
        let message = Remote {
            node: destination.node,
            interface: destination.interface,
            arrival,
            frame,
        };
        match transport.send(destination.system, message) {
            Ok(()) => Route::Remote,
            Err(err) => {
                debug!(node = destination.node, %err, "remote delivery failed");
                Route::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{Decode as _, Encode as _};
    use commonware_macros::test_traced;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Clone, Default)]
    struct Captured(Rc<RefCell<Vec<(System, Remote)>>>);

    impl Transport for Captured {
        fn send(&mut self, system: System, message: Remote) -> Result<(), Unreachable> {
            self.0.borrow_mut().push((system, message));
            Ok(())
        }
    }

    struct Disconnected;

    impl Transport for Disconnected {
        fn send(&mut self, system: System, _: Remote) -> Result<(), Unreachable> {
            Err(Unreachable(system))
        }
    }

    fn destination(system: System) -> Destination {
        Destination {
            endpoint: 3,
            node: 7,
            interface: 1,
            system,
        }
    }

    #[test_traced]
    fn test_remote_codec() {
        let remote = Remote {
            node: 2,
            interface: 1,
            arrival: UNIX_EPOCH + Duration::from_nanos(2_003_638_400),
            frame: Bytes::from_static(b"frame"),
        };
        let encoded = remote.encode();
        assert_eq!(encoded.len(), 25);
        assert_eq!(&encoded[..4], &[0, 0, 0, 2]);
        assert_eq!(
            Remote::decode_cfg(encoded.freeze(), &MAX_REMOTE_FRAME).unwrap(),
            remote
        );
    }

    #[test_traced]
    fn test_remote_rejects_bad_input() {
        let remote = Remote {
            node: 2,
            interface: 1,
            arrival: UNIX_EPOCH,
            frame: Bytes::from_static(b"frame"),
        };
        let encoded = remote.encode().freeze();
        assert!(matches!(
            Remote::decode_cfg(encoded.slice(..encoded.len() - 1), &MAX_REMOTE_FRAME),
            Err(Error::EndOfBuffer)
        ));

        let mut oversized = encoded.to_vec();
        oversized[16..20].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Remote::decode_cfg(Bytes::from(oversized), &MAX_REMOTE_FRAME),
            Err(Error::InvalidLength(len)) if len == u32::MAX as usize
        ));

        // The limit comes from the caller
        assert!(matches!(
            Remote::decode_cfg(encoded, &4),
            Err(Error::InvalidLength(5))
        ));
    }

    #[test_traced]
    fn test_largest_frame_crosses_contexts() {
        let mut scheduler = Scheduler::new();
        let captured = Captured::default();
        let mut router = Router::distributed(0, Box::new(captured.clone()));
        let frame = Bytes::from(vec![1u8; MAX_REMOTE_FRAME]);
        let route = router.deliver(
            &mut scheduler,
            destination(1),
            frame.clone(),
            UNIX_EPOCH + Duration::from_millis(5),
            Duration::from_millis(2),
        );
        assert_eq!(route, Route::Remote);

        let (_, sent) = captured.0.borrow_mut().pop().unwrap();
        let encoded = sent.encode().freeze();
        let decoded = Remote::decode_cfg(encoded, &MAX_REMOTE_FRAME).unwrap();
        assert_eq!(decoded.frame, frame);
    }

    #[test_traced]
    #[should_panic(expected = "exceeds the remote limit")]
    fn test_oversized_remote_frame_panics() {
        let mut scheduler = Scheduler::new();
        let mut router = Router::distributed(0, Box::new(Captured::default()));
        router.deliver(
            &mut scheduler,
            destination(1),
            Bytes::from(vec![1u8; MAX_REMOTE_FRAME + 1]),
            UNIX_EPOCH + Duration::from_millis(5),
            Duration::from_millis(2),
        );
    }

    #[test_traced]
    fn test_unreachable_context_is_reported() {
        let mut scheduler = Scheduler::new();
        let mut router = Router::distributed(0, Box::new(Disconnected));
        let route = router.deliver(
            &mut scheduler,
            destination(1),
            Bytes::from_static(b"frame"),
            UNIX_EPOCH + Duration::from_millis(5),
            Duration::from_millis(2),
        );
        assert_eq!(route, Route::Unreachable);
        assert!(scheduler.is_empty());
    }

    #[test_traced]
    fn test_local_delivery_schedules_arrival() {
        let mut scheduler = Scheduler::new();
        let mut router = Router::Local;
        let arrival = UNIX_EPOCH + Duration::from_millis(5);
        let route = router.deliver(
            &mut scheduler,
            destination(0),
            Bytes::from_static(b"frame"),
            arrival,
            Duration::ZERO,
        );
        assert_eq!(route, Route::Local);
        let fired = scheduler.pop().unwrap();
        assert_eq!(fired.time, arrival);
        assert_eq!(fired.context, Some(7));
        assert!(matches!(fired.event, Event::Arrival { endpoint: 3, .. }));
    }

    #[test_traced]
    fn test_distributed_delivery() {
        let mut scheduler = Scheduler::new();
        let captured = Captured::default();
        let mut router = Router::distributed(0, Box::new(captured.clone()));
        let arrival = UNIX_EPOCH + Duration::from_millis(5);

        // Same context stays local
        let route = router.deliver(
            &mut scheduler,
            destination(0),
            Bytes::from_static(b"a"),
            arrival,
            Duration::from_millis(2),
        );
        assert_eq!(route, Route::Local);
        assert_eq!(scheduler.len(), 1);

        // Other contexts go through the transport
        let route = router.deliver(
            &mut scheduler,
            destination(1),
            Bytes::from_static(b"b"),
            arrival,
            Duration::from_millis(2),
        );
        assert_eq!(route, Route::Remote);
        assert_eq!(scheduler.len(), 1);
        let sent = captured.0.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert_eq!(sent[0].1.node, 7);
        assert_eq!(sent[0].1.interface, 1);
        assert_eq!(sent[0].1.arrival, arrival);
    }

    #[test_traced]
    #[should_panic(expected = "there is no transport")]
    fn test_local_router_rejects_remote_destination() {
        let mut scheduler = Scheduler::new();
        Router::Local.deliver(
            &mut scheduler,
            destination(1),
            Bytes::from_static(b"frame"),
            UNIX_EPOCH,
            Duration::ZERO,
        );
    }

    #[test_traced]
    #[should_panic(expected = "inside the lookahead window")]
    fn test_remote_arrival_inside_lookahead_panics() {
        let mut scheduler = Scheduler::new();
        let mut router = Router::distributed(0, Box::new(Captured::default()));
        router.deliver(
            &mut scheduler,
            destination(1),
            Bytes::from_static(b"frame"),
            UNIX_EPOCH + Duration::from_millis(1),
            Duration::from_millis(2),
        );
    }
}
