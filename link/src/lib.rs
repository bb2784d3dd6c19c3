//! Simulate steerable point-to-point links between mobile nodes.
//!
//! Every node owns one or more [endpoint::Endpoint]s attached to a shared
//! [medium::Medium]. Two endpoints exchange frames only once they are
//! _aligned_: each node has declared a connection towards the other (as if
//! both had steered a directional antenna at their peer). Alignment can be
//! declared and withdrawn at any simulated time.
//!
//! A transmitted frame occupies the sender's wire for `size / data rate`,
//! then travels for the propagation delay between the two nodes' current
//! positions. Frames waiting for the wire sit in a bounded drop-tail
//! [queue::Queue] that pushes back on the upper layer when it fills up.
//!
//! # Distribution
//!
//! A topology can be split across several [Simulation] contexts (one per
//! thread, or per process). Every context holds a replica of the topology and
//! executes only the nodes it owns. Frames destined to a node owned elsewhere
//! are handed to a [router::Transport] and scheduled by the receiving context
//! at the exact arrival instant computed by the sender, so distributed runs
//! observe the same timing as local ones.
//!
//! # Example
//!
//! ```rust
//! use beamlink::{
//!     frame::{Address, ETHERTYPE_IPV4},
//!     mobility::{Fixed, Position},
//!     observer::Recorder,
//!     router::Router,
//!     Config, Simulation,
//! };
//! use bytes::Bytes;
//! use std::time::{Duration, UNIX_EPOCH};
//!
//! let mut simulation = Simulation::new(Config::default(), Router::Local).unwrap();
//! simulation.add_node(0, 0, Box::new(Fixed(Position::new(0.0, 0.0, 0.0)))).unwrap();
//! simulation.add_node(1, 0, Box::new(Fixed(Position::new(3_000.0, 0.0, 0.0)))).unwrap();
//! let endpoints = simulation.install(&[0, 1], 1).unwrap();
//!
//! // Steer both endpoints at each other
//! simulation.declare(0, endpoints[0], 1);
//! simulation.declare(1, endpoints[1], 0);
//!
//! let recorder = Recorder::new();
//! simulation.observe(Box::new(recorder.clone()));
//! simulation.schedule_send(
//!     UNIX_EPOCH + Duration::from_secs(1),
//!     endpoints[0],
//!     Address::BROADCAST,
//!     ETHERTYPE_IPV4,
//!     Bytes::from_static(b"hello"),
//! );
//! simulation.run();
//! assert_eq!(recorder.drops(), vec![]);
//! ```

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod endpoint;
pub mod error_model;
pub mod frame;
pub mod medium;
pub mod metrics;
pub mod mobility;
pub mod node;
pub mod observer;
pub mod queue;
pub mod router;
pub mod simulation;
pub mod transport;

pub use config::Config;
pub use node::NodeId;
pub use simulation::{Event, Simulation};

/// Errors that can occur while building a simulation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),
    #[error("node {0} not found")]
    UnknownNode(NodeId),
    #[error("node {node} runs in context {system} but there is no transport")]
    TransportRequired { node: NodeId, system: u32 },
    #[error("data rate must be positive")]
    ZeroDataRate,
    #[error("invalid data rate: {0}")]
    InvalidDataRate(String),
    #[error("error rate must be in [0, 1]: {0}")]
    InvalidErrorRate(f64),
    #[error("invalid delay range: {0:?} > {1:?}")]
    InvalidDelayRange(Duration, Duration),
    #[error("propagation speed must be positive: {0}")]
    InvalidSpeed(f64),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
