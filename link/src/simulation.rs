//! Drive nodes, endpoints and the medium from a single event timeline.
//!
//! A [Simulation] is one context: it holds a replica of the whole topology
//! (every node, every endpoint, every declaration) but only executes the
//! nodes whose system matches its [Router]. Topology changes
//! (declare/withdraw) run in every context so the replicas stay identical;
//! sends only run in the context that owns the sending node.

use crate::{
    config::Config,
    endpoint::{Admission, Endpoint, EndpointId, Identity, ReceiveCallback},
    frame::{self, Address},
    medium::{Change, Medium, Transmission},
    metrics::{self, Metrics},
    mobility::{Mobility, PropagationDelay},
    node::{Node, NodeId, Routing},
    observer::{Observer, Reason},
    queue::Queue,
    router::{Destination, Remote, Route, Router, System},
    Error,
};
use beamlink_scheduler::{
    deterministic::{Fired, Scheduler},
    Clock,
};
use bytes::Bytes;
use commonware_utils::SystemTimeExt;
use prometheus_client::registry::Registry;
use std::{collections::BTreeMap, time::SystemTime};
use tracing::{debug, debug_span, trace};

/// Everything that can happen on the timeline.
#[derive(Debug)]
pub enum Event {
    /// An upper layer hands a payload to an endpoint.
    Send {
        endpoint: EndpointId,
        destination: Address,
        ethertype: u16,
        payload: Bytes,
    },
    /// The frame on the wire of `endpoint` (and its inter-frame gap) is done.
    TransmitComplete { endpoint: EndpointId },
    /// A frame reaches `endpoint`.
    Arrival { endpoint: EndpointId, frame: Bytes },
    /// `node` points `endpoint` at `remote`.
    Declare {
        node: NodeId,
        endpoint: EndpointId,
        remote: NodeId,
    },
    /// `node` stops pointing `endpoint` at `remote`.
    Withdraw {
        node: NodeId,
        endpoint: EndpointId,
        remote: NodeId,
    },
}

/// One simulation context.
pub struct Simulation {
    scheduler: Scheduler<Event>,
    nodes: BTreeMap<NodeId, Node>,
    medium: Medium,
    router: Router,
    config: Config,
    next_address: u64,

    observers: Vec<Box<dyn Observer>>,
    registry: Registry,
    metrics: Metrics,
}

impl Simulation {
    /// Build a context from `config`.
    pub fn new(config: Config, router: Router) -> Result<Self, Error> {
        let delay = config.delay.build()?;
        Ok(Self::with_delay(config, router, delay))
    }

    /// Build a context with a custom propagation delay model (the one in
    /// `config` is ignored).
    pub fn with_delay(config: Config, router: Router, delay: Box<dyn PropagationDelay>) -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::init(&mut registry);
        Self {
            scheduler: Scheduler::new(),
            nodes: BTreeMap::new(),
            medium: Medium::new(delay, config.medium.lookahead),
            router,
            config,
            next_address: 1,
            observers: Vec::new(),
            registry,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Context executed by this simulation.
    pub fn system(&self) -> System {
        self.router.system()
    }

    pub fn now(&self) -> SystemTime {
        self.scheduler.current()
    }

    /// Time of the next pending event.
    pub fn next(&self) -> Option<SystemTime> {
        self.scheduler.next()
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<Event> {
        &mut self.scheduler
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Panics if `id` was never added.
    pub fn endpoint(&self, id: EndpointId) -> &Endpoint {
        self.medium.endpoint(id)
    }

    /// Panics if `id` was never added.
    pub fn endpoint_mut(&mut self, id: EndpointId) -> &mut Endpoint {
        self.medium.endpoint_mut(id)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Render all metrics in the text exposition format.
    pub fn encode_metrics(&self) -> String {
        metrics::render(&self.registry)
    }

    /// Register an additional observer.
    pub fn observe(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Returns true if `node` is executed by this context.
    pub fn is_local(&self, node: NodeId) -> bool {
        self.nodes
            .get(&node)
            .is_some_and(|node| node.system() == self.router.system())
    }

    /// Add a node executed by context `system`.
    pub fn add_node(
        &mut self,
        id: NodeId,
        system: System,
        mobility: Box<dyn Mobility>,
    ) -> Result<(), Error> {
        if self.nodes.contains_key(&id) {
            return Err(Error::DuplicateNode(id));
        }
        if !self.router.is_distributed() && system != self.router.system() {
            return Err(Error::TransportRequired { node: id, system });
        }
        self.nodes.insert(id, Node::new(id, system, mobility));
        Ok(())
    }

    /// Notify `routing` whenever an interface of `node` goes up or down.
    pub fn set_routing(&mut self, node: NodeId, routing: Box<dyn Routing>) -> Result<(), Error> {
        let node = self.nodes.get_mut(&node).ok_or(Error::UnknownNode(node))?;
        node.routing = Some(routing);
        Ok(())
    }

    /// Create an endpoint on `node` without attaching it to the medium.
    pub fn add_endpoint(&mut self, node: NodeId) -> Result<EndpointId, Error> {
        let interface = self
            .nodes
            .get(&node)
            .ok_or(Error::UnknownNode(node))?
            .next_interface();
        let corruption = self
            .config
            .error_model
            .build(self.medium.len() as u64)?;
        let address = Address::from_u64(self.next_address);
        self.next_address += 1;

        let identity = Identity {
            node,
            interface,
            address,
        };
        let mut endpoint = Endpoint::new(
            identity,
            self.config.device,
            Queue::new(self.config.queue.limit),
        );
        endpoint.set_corruption(corruption);
        let id = self.medium.add(endpoint);
        if let Some(node) = self.nodes.get_mut(&node) {
            node.add_interface(id);
        }
        Ok(id)
    }

    /// Attach `endpoint` to the medium, bringing its link up.
    pub fn attach_endpoint(&mut self, endpoint: EndpointId) {
        self.medium.attach(endpoint);
        let identity = self.medium.endpoint(endpoint).identity();
        let now = self.now();
        self.notify(|observer| observer.link_state_change(now, &identity, true));
    }

    /// Create an endpoint on `node` and attach it.
    pub fn attach(&mut self, node: NodeId) -> Result<EndpointId, Error> {
        let endpoint = self.add_endpoint(node)?;
        self.attach_endpoint(endpoint);
        Ok(endpoint)
    }

    /// Attach `per_node` endpoints to each of `nodes`, returned node by node.
    pub fn install(&mut self, nodes: &[NodeId], per_node: usize) -> Result<Vec<EndpointId>, Error> {
        let mut endpoints = Vec::with_capacity(nodes.len() * per_node);
        for &node in nodes {
            for _ in 0..per_node {
                endpoints.push(self.attach(node)?);
            }
        }
        Ok(endpoints)
    }

    /// Endpoint with interface index `interface` on `node`.
    ///
    /// Panics if either does not exist.
    pub fn interface(&self, node: NodeId, interface: u32) -> EndpointId {
        let Some(node) = self.nodes.get(&node) else {
            panic!("node {node} not found");
        };
        match node.interface(interface) {
            Some(endpoint) => endpoint,
            None => panic!("node {} has no interface {interface}", node.id()),
        }
    }

    pub fn set_receive_callback(&mut self, endpoint: EndpointId, callback: ReceiveCallback) {
        self.medium
            .endpoint_mut(endpoint)
            .set_receive_callback(callback);
    }

    pub fn set_promiscuous_callback(&mut self, endpoint: EndpointId, callback: ReceiveCallback) {
        self.medium
            .endpoint_mut(endpoint)
            .set_promiscuous_callback(callback);
    }

    /// Returns true if a connection between `a` and `b` is declared in one
    /// direction only.
    pub fn is_one_way_connection(&self, a: NodeId, b: NodeId) -> bool {
        self.medium.is_one_way_connection(a, b)
    }

    /// Point `endpoint` (on `node`) at `remote` now.
    pub fn declare(&mut self, node: NodeId, endpoint: EndpointId, remote: NodeId) {
        assert!(self.nodes.contains_key(&remote), "node {remote} not found");
        let changes = self.medium.declare(node, endpoint, remote);
        self.apply(changes);
    }

    /// Stop pointing `endpoint` (on `node`) at `remote` now.
    pub fn withdraw(&mut self, node: NodeId, endpoint: EndpointId, remote: NodeId) {
        let changes = self.medium.withdraw(node, endpoint, remote);
        self.apply(changes);
    }

    pub fn schedule_declare(
        &mut self,
        at: SystemTime,
        node: NodeId,
        endpoint: EndpointId,
        remote: NodeId,
    ) {
        self.scheduler.schedule_at(
            at,
            None,
            Event::Declare {
                node,
                endpoint,
                remote,
            },
        );
    }

    pub fn schedule_withdraw(
        &mut self,
        at: SystemTime,
        node: NodeId,
        endpoint: EndpointId,
        remote: NodeId,
    ) {
        self.scheduler.schedule_at(
            at,
            None,
            Event::Withdraw {
                node,
                endpoint,
                remote,
            },
        );
    }

    /// Schedule a send at `at`. Ignored if the sending node is executed by
    /// another context.
    pub fn schedule_send(
        &mut self,
        at: SystemTime,
        endpoint: EndpointId,
        destination: Address,
        ethertype: u16,
        payload: Bytes,
    ) {
        let node = self.medium.endpoint(endpoint).node();
        if !self.is_local(node) {
            trace!(node, endpoint, "send belongs to another context");
            return;
        }
        self.scheduler.schedule_at(
            at,
            Some(node),
            Event::Send {
                endpoint,
                destination,
                ethertype,
                payload,
            },
        );
    }

    /// Hand `payload` to `endpoint` for transmission to `destination`.
    ///
    /// Returns false if the frame was dropped. Panics if the endpoint's node
    /// is executed by another context or `ethertype` has no protocol tag.
    pub fn send(
        &mut self,
        endpoint: EndpointId,
        destination: Address,
        ethertype: u16,
        payload: &[u8],
    ) -> bool {
        let (identity, link_up) = {
            let endpoint = self.medium.endpoint(endpoint);
            (endpoint.identity(), endpoint.is_link_up())
        };
        assert!(
            self.is_local(identity.node),
            "node {} is not executed by context {}",
            identity.node,
            self.router.system()
        );
        if !link_up {
            debug!(endpoint = %identity, "link down");
            self.report_drop(&identity, &Bytes::copy_from_slice(payload), Reason::LinkDown);
            return false;
        }
        if self.medium.partner(endpoint).is_none() {
            debug!(endpoint = %identity, "no alignment partner");
            self.report_drop(&identity, &Bytes::copy_from_slice(payload), Reason::Unaligned);
            return false;
        }

        let frame = frame::encapsulate(payload, ethertype, destination, identity.address);
        match self.medium.endpoint_mut(endpoint).admit(frame) {
            Admission::Dropped(frame) => {
                self.report_drop(&identity, &frame, Reason::QueueFull);
                false
            }
            Admission::Queued => true,
            Admission::Transmit(frame) => self.transmit_start(endpoint, frame),
        }
    }

    /// Schedule a frame received from another context at the arrival time
    /// computed by the sender.
    ///
    /// Panics if the destination is unknown, not executed here, or the
    /// arrival time has already passed.
    pub fn accept(&mut self, remote: Remote) {
        let Some(node) = self.nodes.get(&remote.node) else {
            panic!("frame for unknown node {}", remote.node);
        };
        assert_eq!(
            node.system(),
            self.router.system(),
            "frame for node {} delivered to the wrong context",
            remote.node
        );
        let Some(endpoint) = node.interface(remote.interface) else {
            panic!(
                "frame for unknown interface {} on node {}",
                remote.interface, remote.node
            );
        };
        trace!(
            node = remote.node,
            interface = remote.interface,
            arrival = ?remote.arrival.epoch(),
            "accepted remote frame"
        );
        self.scheduler.schedule_at(
            remote.arrival,
            Some(remote.node),
            Event::Arrival {
                endpoint,
                frame: remote.frame,
            },
        );
    }

    /// Execute the next event. Returns false if there was none.
    pub fn step(&mut self) -> bool {
        let Some(fired) = self.scheduler.pop() else {
            return false;
        };
        self.handle(fired);
        true
    }

    /// Execute events until none are left. Returns how many ran.
    pub fn run(&mut self) -> u64 {
        let mut executed = 0;
        while self.step() {
            executed += 1;
        }
        executed
    }

    /// Execute every event at or before `time`, then move the clock to
    /// `time`. Returns how many ran.
    pub fn run_until(&mut self, time: SystemTime) -> u64 {
        let mut executed = 0;
        while self.next().is_some_and(|next| next <= time) {
            self.step();
            executed += 1;
        }
        if time > self.now() {
            self.scheduler.advance_to(time);
        }
        executed
    }

    /// Execute every event strictly before `bound`, then move the clock to
    /// `bound`. Returns how many ran.
    pub fn run_before(&mut self, bound: SystemTime) -> u64 {
        let mut executed = 0;
        while let Some(fired) = self.scheduler.pop_before(bound) {
            self.handle(fired);
            executed += 1;
        }
        if bound > self.now() {
            self.scheduler.advance_to(bound);
        }
        executed
    }

    fn handle(&mut self, fired: Fired<Event>) {
        let _guard = debug_span!("event", node = ?fired.context).entered();
        match fired.event {
            Event::Send {
                endpoint,
                destination,
                ethertype,
                payload,
            } => {
                self.send(endpoint, destination, ethertype, &payload);
            }
            Event::TransmitComplete { endpoint } => self.transmit_complete(endpoint),
            Event::Arrival { endpoint, frame } => self.receive(endpoint, frame),
            Event::Declare {
                node,
                endpoint,
                remote,
            } => self.declare(node, endpoint, remote),
            Event::Withdraw {
                node,
                endpoint,
                remote,
            } => self.withdraw(node, endpoint, remote),
        }
    }

    /// Put `frame` on the wire of `endpoint` and hand it to the medium.
    ///
    /// The completion is scheduled even if the medium cannot deliver: the
    /// wire stays busy for the frame's duration either way.
    fn transmit_start(&mut self, endpoint: EndpointId, frame: Bytes) -> bool {
        let now = self.now();
        let (identity, tx_time, gap) = {
            let endpoint = self.medium.endpoint_mut(endpoint);
            let tx_time = endpoint.begin(frame.clone());
            (endpoint.identity(), tx_time, endpoint.interframe_gap())
        };
        self.notify(|observer| observer.transmit_begin(now, &identity, &frame));
        self.scheduler.schedule_with_context(
            tx_time + gap,
            identity.node,
            Event::TransmitComplete { endpoint },
        );

        let delivered = match self
            .medium
            .transmit_start(now, endpoint, tx_time, &self.nodes)
        {
            Some(Transmission {
                destination,
                arrival,
            }) => {
                let target = self.medium.endpoint(destination).identity();
                let system = match self.nodes.get(&target.node) {
                    Some(node) => node.system(),
                    None => panic!("node {} not found", target.node),
                };
                debug!(
                    from = %identity,
                    to = %target,
                    size = frame.len(),
                    arrival = ?arrival.epoch(),
                    "transmitting"
                );
                let lookahead = self.medium.lookahead();
                let route = self.router.deliver(
                    &mut self.scheduler,
                    Destination {
                        endpoint: destination,
                        node: target.node,
                        interface: target.interface,
                        system,
                    },
                    frame.clone(),
                    arrival,
                    lookahead,
                );
                if route == Route::Unreachable {
                    self.report_drop(&identity, &frame, Reason::Unreachable);
                    false
                } else {
                    true
                }
            }
            None => {
                debug!(endpoint = %identity, "alignment lost before transmission");
                self.report_drop(&identity, &frame, Reason::Unaligned);
                false
            }
        };
        self.medium.endpoint_mut(endpoint).transmitted();
        delivered
    }

    fn transmit_complete(&mut self, endpoint: EndpointId) {
        let now = self.now();
        let (identity, finished, next) = {
            let endpoint = self.medium.endpoint_mut(endpoint);
            let (finished, next) = endpoint.complete();
            (endpoint.identity(), finished, next)
        };
        self.notify(|observer| observer.transmit_end(now, &identity, &finished));
        if let Some(frame) = next {
            self.transmit_start(endpoint, frame);
        }
    }

    fn receive(&mut self, endpoint: EndpointId, frame: Bytes) {
        let now = self.now();
        let (identity, received) = {
            let endpoint = self.medium.endpoint_mut(endpoint);
            (endpoint.identity(), endpoint.accept(&frame))
        };
        let Some(received) = received else {
            debug!(endpoint = %identity, size = frame.len(), "corrupt frame");
            self.report_drop(&identity, &frame, Reason::Corrupt);
            return;
        };
        trace!(
            endpoint = %identity,
            source = %received.source,
            size = frame.len(),
            "received"
        );
        self.notify(|observer| observer.receive(now, &identity, &frame));

        let endpoint = self.medium.endpoint_mut(endpoint);
        if let Some(callback) = endpoint.on_promiscuous.as_mut() {
            callback(&mut self.scheduler, &received);
        }
        if let Some(callback) = endpoint.on_receive.as_mut() {
            callback(&mut self.scheduler, &received);
        }
    }

    fn apply(&mut self, changes: Vec<Change>) {
        let now = self.now();
        for change in changes {
            let (pair, up) = match change {
                Change::Up { endpoint, partner } => ([endpoint, partner], true),
                Change::Down { endpoint, partner } => ([endpoint, partner], false),
            };
            for endpoint in pair {
                let identity = self.medium.endpoint(endpoint).identity();
                if let Some(routing) = self
                    .nodes
                    .get_mut(&identity.node)
                    .and_then(|node| node.routing.as_mut())
                {
                    if up {
                        routing.interface_up(identity.interface);
                    } else {
                        routing.interface_down(identity.interface);
                    }
                }
                self.notify(|observer| observer.link_state_change(now, &identity, up));
            }
        }
    }

    fn report_drop(&mut self, identity: &Identity, frame: &Bytes, reason: Reason) {
        let now = self.now();
        debug!(endpoint = %identity, %reason, size = frame.len(), "dropped frame");
        self.notify(|observer| observer.dropped(now, identity, frame, reason));
    }

    fn notify(&mut self, mut f: impl FnMut(&mut dyn Observer)) {
        f(&mut self.metrics);
        for observer in self.observers.iter_mut() {
            f(observer.as_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DelayConfig,
        frame::ETHERTYPE_IPV4,
        mobility::{Fixed, Position},
        observer::{Record, Recorder},
    };
    use commonware_macros::test_traced;
    use std::time::{Duration, UNIX_EPOCH};

    fn simulation() -> (Simulation, EndpointId, EndpointId) {
        let config = Config {
            delay: DelayConfig::Fixed {
                delay: Duration::from_millis(2),
            },
            ..Default::default()
        };
        let mut simulation = Simulation::new(config, Router::Local).unwrap();
        simulation
            .add_node(0, 0, Box::new(Fixed(Position::default())))
            .unwrap();
        simulation
            .add_node(1, 0, Box::new(Fixed(Position::default())))
            .unwrap();
        let endpoints = simulation.install(&[0, 1], 1).unwrap();
        (simulation, endpoints[0], endpoints[1])
    }

    #[test_traced]
    fn test_install_assigns_interfaces_and_addresses() {
        let mut simulation = Simulation::new(Config::default(), Router::Local).unwrap();
        for node in 0..2 {
            simulation
                .add_node(node, 0, Box::new(Fixed(Position::default())))
                .unwrap();
        }
        let endpoints = simulation.install(&[0, 1], 3).unwrap();
        assert_eq!(endpoints, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(simulation.interface(1, 1), 4);

        let identity = simulation.endpoint(4).identity();
        assert_eq!(identity.node, 1);
        assert_eq!(identity.interface, 1);
        assert_eq!(identity.address, Address::from_u64(5));
        assert!(simulation.endpoint(4).is_link_up());
    }

    #[test_traced]
    fn test_node_errors() {
        let (mut simulation, _, _) = simulation();
        assert!(matches!(
            simulation.add_node(0, 0, Box::new(Fixed(Position::default()))),
            Err(Error::DuplicateNode(0))
        ));
        assert!(matches!(
            simulation.add_node(5, 1, Box::new(Fixed(Position::default()))),
            Err(Error::TransportRequired { node: 5, system: 1 })
        ));
        assert!(matches!(simulation.attach(9), Err(Error::UnknownNode(9))));
    }

    #[test_traced]
    fn test_unattached_send_drops_link_down() {
        let (mut simulation, _, _) = simulation();
        let recorder = Recorder::new();
        simulation.observe(Box::new(recorder.clone()));
        let endpoint = simulation.add_endpoint(0).unwrap();
        assert!(!simulation.send(endpoint, Address::BROADCAST, ETHERTYPE_IPV4, b"x"));
        assert_eq!(recorder.drops(), vec![Reason::LinkDown]);
        assert_eq!(
            simulation
                .metrics()
                .dropped_frames(&simulation.endpoint(endpoint).identity(), Reason::LinkDown),
            1
        );
    }

    #[test_traced]
    fn test_unaligned_send_leaves_state_untouched() {
        let (mut simulation, a, _) = simulation();
        let recorder = Recorder::new();
        simulation.observe(Box::new(recorder.clone()));
        assert!(!simulation.send(a, Address::BROADCAST, ETHERTYPE_IPV4, b"x"));
        assert_eq!(recorder.drops(), vec![Reason::Unaligned]);
        assert!(simulation.endpoint(a).queue().is_empty());
        assert!(simulation.next().is_none());
    }

    #[test_traced]
    fn test_round_trip_timing() {
        let (mut simulation, a, b) = simulation();
        let recorder = Recorder::new();
        simulation.observe(Box::new(recorder.clone()));
        simulation.declare(0, a, 1);
        simulation.declare(1, b, 0);

        simulation.schedule_send(
            UNIX_EPOCH + Duration::from_secs(1),
            a,
            Address::BROADCAST,
            ETHERTYPE_IPV4,
            Bytes::from(vec![0u8; 18]),
        );
        simulation.run();

        // 32 bytes at 32768bps is 7.8125ms
        let arrival = UNIX_EPOCH
            + Duration::from_secs(1)
            + Duration::from_micros(7_812)
            + Duration::from_nanos(500)
            + Duration::from_millis(2);
        let receives: Vec<_> = recorder
            .records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Receive { time, endpoint, len } => Some((time, endpoint.node, len)),
                _ => None,
            })
            .collect();
        assert_eq!(receives, vec![(arrival, 1, 32)]);
    }
}
