//! Execute simulation events in timestamp order on a deterministic timeline.
//!
//! The [deterministic::Scheduler] owns simulated time. Events are plain values
//! (usually an enum defined by the caller) that are released in
//! `(time, insertion order)` order, so two runs that schedule the same events
//! observe the same timeline. Nothing blocks and nothing is preempted: a caller
//! pops an event, handles it (possibly scheduling more), and pops again.
//!
//! Every event may be tagged with a context (the id of the node it executes
//! on). The tag of the event being handled is exposed while it runs so logs and
//! follow-up events can inherit it.
//!
//! # Example
//!
//! ```rust
//! use beamlink_scheduler::{deterministic::Scheduler, Clock};
//! use std::time::{Duration, UNIX_EPOCH};
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.schedule(Duration::from_secs(2), "second");
//! scheduler.schedule_with_context(Duration::from_secs(1), 7, "first");
//!
//! let fired = scheduler.pop().unwrap();
//! assert_eq!(fired.event, "first");
//! assert_eq!(fired.context, Some(7));
//! assert_eq!(scheduler.current(), UNIX_EPOCH + Duration::from_secs(1));
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod deterministic;
pub mod telemetry;

/// Errors that can occur when interacting with the scheduler crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}

/// Interface that any simulated timeline exposes.
pub trait Clock {
    /// Returns the current simulated time.
    fn current(&self) -> SystemTime;
}

/// Convert a number of seconds (as used in scenario descriptions) into a
/// point on the simulated timeline.
pub fn at_secs_f64(secs: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(secs)
}
