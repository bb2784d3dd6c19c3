//! The shared medium endpoints attach to, and the alignment protocol that
//! decides which endpoint pairs can hear each other.
//!
//! # Alignment
//!
//! A node points one of its endpoints at a remote node by declaring a
//! connection. Nothing is delivered until the remote node points one of its
//! endpoints back: at that moment both endpoints become aligned (partners).
//! A declaration that has not been reciprocated is kept as a pending one-way
//! connection.
//!
//! Every endpoint has at most one partner. Alignment is symmetric and both
//! partners always hold a declaration towards each other's node.

use crate::{
    endpoint::{Endpoint, EndpointId},
    mobility::{Position, PropagationDelay},
    NodeId,
};
use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};

/// A change of the alignment relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    /// `endpoint` and `partner` became aligned.
    Up {
        endpoint: EndpointId,
        partner: EndpointId,
    },
    /// `endpoint` and `partner` are no longer aligned.
    Down {
        endpoint: EndpointId,
        partner: EndpointId,
    },
}

/// Source of node positions at transmission time.
pub trait Positions {
    fn position(&self, node: NodeId, now: SystemTime) -> Position;
}

/// A frame accepted by the medium.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transmission {
    pub destination: EndpointId,
    pub arrival: SystemTime,
}

/// Attached endpoints plus the declared, aligned and pending relations
/// between them.
pub struct Medium {
    endpoints: Vec<Endpoint>,
    delay: Box<dyn PropagationDelay>,
    lookahead: Duration,

    declared: BTreeMap<(NodeId, EndpointId), NodeId>,
    aligned: BTreeMap<EndpointId, EndpointId>,
    one_way: BTreeMap<(NodeId, EndpointId), NodeId>,
}

impl Medium {
    pub fn new(delay: Box<dyn PropagationDelay>, lookahead: Duration) -> Self {
        Self {
            endpoints: Vec::new(),
            delay,
            lookahead,
            declared: BTreeMap::new(),
            aligned: BTreeMap::new(),
            one_way: BTreeMap::new(),
        }
    }

    /// Minimum delay between a transmission and its arrival at a remote
    /// context.
    pub fn lookahead(&self) -> Duration {
        self.lookahead
    }

    /// Register `endpoint`. Its link stays down until [Medium::attach].
    pub fn add(&mut self, endpoint: Endpoint) -> EndpointId {
        let id = self.endpoints.len();
        self.endpoints.push(endpoint);
        id
    }

    /// Mark the link of `id` up.
    pub fn attach(&mut self, id: EndpointId) {
        let endpoint = self.endpoint_mut(id);
        endpoint.mark_link_up();
        debug!(id, endpoint = %endpoint.identity(), "attached endpoint");
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Panics if `id` was never registered.
    pub fn endpoint(&self, id: EndpointId) -> &Endpoint {
        self.endpoints
            .get(id)
            .unwrap_or_else(|| panic!("endpoint {id} not registered"))
    }

    /// Panics if `id` was never registered.
    pub fn endpoint_mut(&mut self, id: EndpointId) -> &mut Endpoint {
        self.endpoints
            .get_mut(id)
            .unwrap_or_else(|| panic!("endpoint {id} not registered"))
    }

    /// Alignment partner of `endpoint`.
    pub fn partner(&self, endpoint: EndpointId) -> Option<EndpointId> {
        self.aligned.get(&endpoint).copied()
    }

    /// Remote node `endpoint` (on `node`) has declared a connection to.
    pub fn declared(&self, node: NodeId, endpoint: EndpointId) -> Option<NodeId> {
        self.declared.get(&(node, endpoint)).copied()
    }

    /// Returns true if a connection between `a` and `b` has been declared in
    /// one direction but not reciprocated.
    pub fn is_one_way_connection(&self, a: NodeId, b: NodeId) -> bool {
        self.one_way
            .iter()
            .any(|(&(node, _), &remote)| (node == a && remote == b) || (node == b && remote == a))
    }

    fn check_owner(&self, node: NodeId, endpoint: EndpointId) {
        let owner = self.endpoint(endpoint).node();
        assert_eq!(
            owner, node,
            "endpoint {endpoint} belongs to node {owner}, not {node}"
        );
    }

    /// First unaligned endpoint on `owner` declaring `target`, and whether any
    /// endpoint on `owner` declares `target` at all.
    fn unaligned_declaring(&self, owner: NodeId, target: NodeId) -> (bool, Option<EndpointId>) {
        let mut declared = false;
        for (&(node, endpoint), &remote) in self.declared.iter() {
            if node != owner || remote != target {
                continue;
            }
            declared = true;
            if !self.aligned.contains_key(&endpoint) {
                return (true, Some(endpoint));
            }
        }
        (declared, None)
    }

    /// Point `endpoint` (on `node`) at `remote`.
    ///
    /// Aligns the endpoint if `remote` already points an unaligned endpoint
    /// back at `node`. Re-declaring the same remote on an aligned endpoint is
    /// a no-op (on an unaligned one it looks for a partner again); declaring a
    /// different remote first withdraws the previous declaration.
    pub fn declare(&mut self, node: NodeId, endpoint: EndpointId, remote: NodeId) -> Vec<Change> {
        self.check_owner(node, endpoint);
        assert_ne!(node, remote, "node {node} cannot connect to itself");
        let mut changes = Vec::new();
        match self.declared(node, endpoint) {
            Some(previous) if previous == remote => {
                if self.aligned.contains_key(&endpoint) {
                    debug!(node, endpoint, remote, "connection already declared");
                    return changes;
                }
            }
            Some(previous) => {
                debug!(node, endpoint, previous, remote, "re-pointing connection");
                changes.extend(self.withdraw(node, endpoint, previous));
            }
            None => {}
        }
        self.declared.insert((node, endpoint), remote);

        // Look for an unaligned endpoint on the remote node pointing back
        let (reciprocated, candidate) = self.unaligned_declaring(remote, node);
        match candidate {
            Some(partner) => {
                self.aligned.insert(endpoint, partner);
                self.aligned.insert(partner, endpoint);
                self.one_way.remove(&(remote, partner));
                debug!(node, endpoint, remote, partner, "aligned");
                changes.push(Change::Up { endpoint, partner });
            }
            None => {
                if reciprocated {
                    warn!(
                        node,
                        endpoint, remote, "remote endpoints already aligned; keeping one-way"
                    );
                }
                self.one_way.insert((node, endpoint), remote);
                debug!(node, endpoint, remote, "one-way connection");
            }
        }
        changes
    }

    /// Remove the declaration of `endpoint` (on `node`) towards `remote`.
    ///
    /// If the endpoint was aligned, both sides lose alignment. The partner
    /// then aligns with another unaligned endpoint on `node` still declaring
    /// its node, if there is one, and otherwise its declaration becomes a
    /// pending one-way connection.
    pub fn withdraw(&mut self, node: NodeId, endpoint: EndpointId, remote: NodeId) -> Vec<Change> {
        self.check_owner(node, endpoint);
        if self.declared(node, endpoint) != Some(remote) {
            debug!(node, endpoint, remote, "no such connection declared");
            return Vec::new();
        }
        self.declared.remove(&(node, endpoint));

        let Some(partner) = self.aligned.remove(&endpoint) else {
            self.one_way.remove(&(node, endpoint));
            debug!(node, endpoint, remote, "withdrew one-way connection");
            return Vec::new();
        };
        self.aligned.remove(&partner);
        debug!(node, endpoint, remote, partner, "unaligned");
        let mut changes = vec![Change::Down { endpoint, partner }];

        // The freed partner may already be reciprocated by another endpoint
        match self.unaligned_declaring(node, remote) {
            (_, Some(other)) => {
                self.aligned.insert(partner, other);
                self.aligned.insert(other, partner);
                self.one_way.remove(&(node, other));
                debug!(
                    node = remote,
                    endpoint = partner,
                    remote = node,
                    partner = other,
                    "aligned"
                );
                changes.push(Change::Up {
                    endpoint: partner,
                    partner: other,
                });
            }
            (_, None) => {
                self.one_way.insert((remote, partner), node);
            }
        }
        changes
    }

    /// Hand a frame from `source` to its partner.
    ///
    /// Returns `None` (and the frame is lost) if `source` has no partner.
    /// Positions are read at `now`.
    pub fn transmit_start(
        &mut self,
        now: SystemTime,
        source: EndpointId,
        tx_time: Duration,
        positions: &impl Positions,
    ) -> Option<Transmission> {
        let destination = self.partner(source)?;
        let from = positions.position(self.endpoint(source).node(), now);
        let to = positions.position(self.endpoint(destination).node(), now);
        let delay = self.delay.delay(&from, &to);
        Some(Transmission {
            destination,
            arrival: now + tx_time + delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DeviceConfig,
        endpoint::Identity,
        frame::Address,
        mobility::{ConstantSpeed, FixedDelay},
        queue::Queue,
    };
    use commonware_macros::test_traced;
    use std::time::UNIX_EPOCH;

    struct Line;

    impl Positions for Line {
        fn position(&self, node: NodeId, _now: SystemTime) -> Position {
            Position::new(node as f64 * 1_000.0, 0.0, 0.0)
        }
    }

    fn medium(endpoints: &[NodeId]) -> Medium {
        let mut medium = Medium::new(Box::new(FixedDelay(Duration::from_millis(2))), Duration::ZERO);
        let mut interfaces = BTreeMap::<NodeId, u32>::new();
        for &node in endpoints {
            let interface = interfaces.entry(node).or_default();
            let identity = Identity {
                node,
                interface: *interface,
                address: Address::from_u64(node as u64 + 1),
            };
            *interface += 1;
            let id = medium.add(Endpoint::new(identity, DeviceConfig::default(), Queue::default()));
            medium.attach(id);
        }
        medium
    }

    #[test_traced]
    fn test_reciprocal_declarations_align() {
        // Endpoint 0 on node 1, endpoint 1 on node 2
        let mut medium = medium(&[1, 2]);
        assert!(medium.endpoint(0).is_link_up());

        assert!(medium.declare(1, 0, 2).is_empty());
        assert!(medium.is_one_way_connection(1, 2));
        assert!(medium.is_one_way_connection(2, 1));
        assert_eq!(medium.partner(0), None);

        let changes = medium.declare(2, 1, 1);
        assert_eq!(
            changes,
            vec![Change::Up {
                endpoint: 1,
                partner: 0
            }]
        );
        assert_eq!(medium.partner(0), Some(1));
        assert_eq!(medium.partner(1), Some(0));
        assert!(!medium.is_one_way_connection(1, 2));

        // Idempotent
        assert!(medium.declare(1, 0, 2).is_empty());
        assert!(medium.declare(2, 1, 1).is_empty());
        assert_eq!(medium.partner(0), Some(1));
    }

    #[test_traced]
    fn test_withdraw_restores_one_way() {
        let mut medium = medium(&[1, 2]);
        medium.declare(1, 0, 2);
        medium.declare(2, 1, 1);

        let changes = medium.withdraw(1, 0, 2);
        assert_eq!(
            changes,
            vec![Change::Down {
                endpoint: 0,
                partner: 1
            }]
        );
        assert_eq!(medium.partner(0), None);
        assert_eq!(medium.partner(1), None);
        assert!(medium.is_one_way_connection(2, 1));
        assert_eq!(medium.declared(1, 0), None);
        assert_eq!(medium.declared(2, 1), Some(1));

        // Withdrawing the remaining side clears everything
        assert!(medium.withdraw(2, 1, 1).is_empty());
        assert!(!medium.is_one_way_connection(1, 2));

        // Withdrawing something never declared is a no-op
        assert!(medium.withdraw(2, 1, 1).is_empty());
    }

    #[test_traced]
    fn test_at_most_one_partner() {
        // Node 1 has two endpoints (0, 1), node 2 has one (2)
        let mut medium = medium(&[1, 1, 2]);
        medium.declare(1, 0, 2);
        medium.declare(1, 1, 2);
        let changes = medium.declare(2, 2, 1);
        assert_eq!(
            changes,
            vec![Change::Up {
                endpoint: 2,
                partner: 0
            }]
        );
        assert_eq!(medium.partner(1), None);
        assert!(medium.is_one_way_connection(1, 2));

        // Once the first partner withdraws, the remaining declaration on
        // node 1 takes its place
        let changes = medium.withdraw(1, 0, 2);
        assert_eq!(
            changes,
            vec![
                Change::Down {
                    endpoint: 0,
                    partner: 2
                },
                Change::Up {
                    endpoint: 2,
                    partner: 1
                },
            ]
        );
        assert_eq!(medium.partner(2), Some(1));
        assert_eq!(medium.partner(1), Some(2));
        assert!(!medium.is_one_way_connection(1, 2));
    }

    #[test_traced]
    fn test_redeclare_after_partner_withdraws() {
        // Node 1 has one endpoint (0), node 2 has two (1, 2)
        let mut medium = medium(&[1, 2, 2]);
        medium.declare(1, 0, 2);
        medium.declare(2, 1, 1);
        medium.declare(2, 2, 1);
        assert_eq!(medium.partner(0), Some(1));
        assert_eq!(medium.partner(2), None);

        // Endpoint 0 leaves and returns: it pairs with the first unaligned
        // endpoint still pointing back
        medium.withdraw(1, 0, 2);
        assert_eq!(medium.partner(1), None);
        assert_eq!(medium.partner(2), None);
        let changes = medium.declare(1, 0, 2);
        assert_eq!(
            changes,
            vec![Change::Up {
                endpoint: 0,
                partner: 1
            }]
        );

        // Re-declaring the unaligned endpoint does not steal the partner
        assert!(medium.declare(2, 2, 1).is_empty());
        assert_eq!(medium.partner(0), Some(1));
        assert_eq!(medium.partner(2), None);
        assert!(medium.is_one_way_connection(2, 1));

        // Once endpoint 1 withdraws, endpoint 0 moves over to endpoint 2
        let changes = medium.withdraw(2, 1, 1);
        assert_eq!(
            changes,
            vec![
                Change::Down {
                    endpoint: 1,
                    partner: 0
                },
                Change::Up {
                    endpoint: 0,
                    partner: 2
                },
            ]
        );
        assert_eq!(medium.partner(0), Some(2));
        assert!(!medium.is_one_way_connection(1, 2));
    }

    #[test_traced]
    fn test_second_reciprocation_stays_pending() {
        // Node 1 has one endpoint (0), node 2 has two (1, 2)
        let mut medium = medium(&[1, 2, 2]);
        medium.declare(1, 0, 2);
        medium.declare(2, 1, 1);
        assert_eq!(medium.partner(0), Some(1));

        assert!(medium.declare(2, 2, 1).is_empty());
        assert_eq!(medium.partner(2), None);
        assert_eq!(medium.partner(0), Some(1));
        assert!(medium.is_one_way_connection(2, 1));
    }

    #[test_traced]
    fn test_repointing_withdraws_previous() {
        let mut medium = medium(&[1, 2, 3]);
        medium.declare(1, 0, 2);
        medium.declare(2, 1, 1);
        medium.declare(3, 2, 1);
        assert_eq!(medium.partner(0), Some(1));

        let changes = medium.declare(1, 0, 3);
        assert_eq!(
            changes,
            vec![
                Change::Down {
                    endpoint: 0,
                    partner: 1
                },
                Change::Up {
                    endpoint: 0,
                    partner: 2
                },
            ]
        );
        assert_eq!(medium.partner(1), None);
        assert!(medium.is_one_way_connection(1, 2));
        assert!(!medium.is_one_way_connection(1, 3));
    }

    #[test_traced]
    fn test_transmit_start() {
        let mut medium = medium(&[1, 2]);
        let now = UNIX_EPOCH + Duration::from_secs(2);
        let tx_time = Duration::from_micros(100);
        assert_eq!(medium.transmit_start(now, 0, tx_time, &Line), None);

        medium.declare(1, 0, 2);
        medium.declare(2, 1, 1);
        let transmission = medium.transmit_start(now, 0, tx_time, &Line).unwrap();
        assert_eq!(transmission.destination, 1);
        assert_eq!(
            transmission.arrival,
            now + tx_time + Duration::from_millis(2)
        );
    }

    #[test_traced]
    fn test_transmit_reads_positions() {
        let mut medium = Medium::new(Box::new(ConstantSpeed::new(1_000.0).unwrap()), Duration::ZERO);
        for node in [1, 3] {
            let identity = Identity {
                node,
                interface: 0,
                address: Address::from_u64(node as u64 + 1),
            };
            let id = medium.add(Endpoint::new(identity, DeviceConfig::default(), Queue::default()));
            medium.attach(id);
        }
        medium.declare(1, 0, 3);
        medium.declare(3, 1, 1);

        // 2km at 1km/s
        let transmission = medium
            .transmit_start(UNIX_EPOCH, 1, Duration::ZERO, &Line)
            .unwrap();
        assert_eq!(transmission.destination, 0);
        assert_eq!(transmission.arrival, UNIX_EPOCH + Duration::from_secs(2));
    }

    #[test_traced]
    #[should_panic(expected = "belongs to node 1, not 2")]
    fn test_declare_foreign_endpoint_panics() {
        let mut medium = medium(&[1, 2]);
        medium.declare(2, 0, 1);
    }
}
