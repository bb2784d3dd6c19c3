use crate::{
    endpoint::EndpointId,
    medium::Positions,
    mobility::{Mobility, Position},
    router::System,
};
use std::{collections::BTreeMap, time::SystemTime};

/// Identifier of a simulated node.
pub type NodeId = u32;

/// Consumer of link-state changes (typically a routing protocol).
pub trait Routing {
    fn interface_up(&mut self, interface: u32);
    fn interface_down(&mut self, interface: u32);
}

/// A simulated node: where it is, which context executes it, and its
/// interfaces.
pub struct Node {
    id: NodeId,
    system: System,
    mobility: Box<dyn Mobility>,
    pub(crate) routing: Option<Box<dyn Routing>>,
    interfaces: Vec<EndpointId>,
}

impl Node {
    pub fn new(id: NodeId, system: System, mobility: Box<dyn Mobility>) -> Self {
        Self {
            id,
            system,
            mobility,
            routing: None,
            interfaces: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Context that executes this node.
    pub fn system(&self) -> System {
        self.system
    }

    pub fn position(&self, now: SystemTime) -> Position {
        self.mobility.position(now)
    }

    /// Endpoints of this node, by interface index.
    pub fn interfaces(&self) -> &[EndpointId] {
        &self.interfaces
    }

    pub fn interface(&self, index: u32) -> Option<EndpointId> {
        self.interfaces.get(index as usize).copied()
    }

    /// Register `endpoint` and return its interface index.
    pub(crate) fn add_interface(&mut self, endpoint: EndpointId) -> u32 {
        self.interfaces.push(endpoint);
        (self.interfaces.len() - 1) as u32
    }

    /// Index the next added interface will get.
    pub(crate) fn next_interface(&self) -> u32 {
        self.interfaces.len() as u32
    }
}

impl Positions for BTreeMap<NodeId, Node> {
    fn position(&self, node: NodeId, now: SystemTime) -> Position {
        match self.get(&node) {
            Some(node) => node.position(now),
            None => panic!("node {node} not found"),
        }
    }
}
