//! A deterministic, single-threaded event timeline.
//!
//! # Ordering
//!
//! Events fire in ascending time. Events scheduled for the same instant fire
//! in the order they were scheduled (ties are broken by a monotonically
//! increasing sequence number, never by the event payload).
//!
//! # Panics
//!
//! Scheduling an event before the current time is a modeling bug and panics.

use crate::Clock;
use commonware_utils::SystemTimeExt;
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;

/// Identifier of the execution context (node) an event runs on.
pub type Context = u32;

/// An event released by the scheduler.
#[derive(Debug)]
pub struct Fired<E> {
    /// When the event fired (the scheduler's current time).
    pub time: SystemTime,
    /// The context the event was tagged with, if any.
    pub context: Option<Context>,
    /// The event payload.
    pub event: E,
}

struct Alarm<E> {
    time: SystemTime,
    sequence: u64,
    context: Option<Context>,
    event: E,
}

impl<E> PartialEq for Alarm<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}

impl<E> Eq for Alarm<E> {}

impl<E> PartialOrd for Alarm<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Alarm<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse the ordering for min-heap
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Discrete-event timeline that releases events in `(time, sequence)` order.
pub struct Scheduler<E> {
    time: SystemTime,
    sequence: u64,
    context: Option<Context>,
    alarms: BinaryHeap<Alarm<E>>,
    fired: u64,
}

impl<E> Scheduler<E> {
    /// Create a scheduler whose clock starts at [UNIX_EPOCH].
    pub fn new() -> Self {
        Self::starting_at(UNIX_EPOCH)
    }

    /// Create a scheduler whose clock starts at `time`.
    pub fn starting_at(time: SystemTime) -> Self {
        Self {
            time,
            sequence: 0,
            context: None,
            alarms: BinaryHeap::new(),
            fired: 0,
        }
    }

    /// Context of the event currently being handled (`None` outside of a
    /// tagged event).
    pub fn context(&self) -> Option<Context> {
        self.context
    }

    /// Schedule `event` after `delay`, inheriting the current context.
    pub fn schedule(&mut self, delay: Duration, event: E) {
        let time = self.after(delay);
        self.insert(time, self.context, event);
    }

    /// Schedule `event` after `delay` on `context`.
    pub fn schedule_with_context(&mut self, delay: Duration, context: Context, event: E) {
        let time = self.after(delay);
        self.insert(time, Some(context), event);
    }

    /// Schedule `event` at the absolute `time` on `context`.
    ///
    /// Panics if `time` is before the current time.
    pub fn schedule_at(&mut self, time: SystemTime, context: Option<Context>, event: E) {
        assert!(
            time >= self.time,
            "cannot schedule in the past (now={:?}, at={:?})",
            self.time.epoch(),
            time.epoch(),
        );
        self.insert(time, context, event);
    }

    /// Time of the earliest pending event.
    pub fn next(&self) -> Option<SystemTime> {
        self.alarms.peek().map(|alarm| alarm.time)
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    /// Returns true if no events are pending.
    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    /// Total number of events released so far.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Release the earliest pending event, advancing the clock to its time.
    pub fn pop(&mut self) -> Option<Fired<E>> {
        let alarm = self.alarms.pop()?;
        Some(self.release(alarm))
    }

    /// Release the earliest pending event if it fires strictly before `bound`.
    ///
    /// This is the primitive used to execute a synchronization window: no
    /// event at or after `bound` is released and the clock never moves past
    /// the last released event.
    pub fn pop_before(&mut self, bound: SystemTime) -> Option<Fired<E>> {
        if self.next()? >= bound {
            return None;
        }
        self.pop()
    }

    /// Move the clock forward to `time` without releasing anything.
    ///
    /// Panics if an event is pending before `time` or if `time` is in the past.
    pub fn advance_to(&mut self, time: SystemTime) {
        assert!(time >= self.time, "cannot move the clock backwards");
        if let Some(next) = self.next() {
            assert!(next >= time, "cannot skip pending events");
        }
        self.time = time;
        self.context = None;
    }

    fn after(&self, delay: Duration) -> SystemTime {
        self.time
            .checked_add(delay)
            .expect("scheduled time overflowed")
    }

    fn insert(&mut self, time: SystemTime, context: Option<Context>, event: E) {
        let sequence = self.sequence;
        self.sequence = self
            .sequence
            .checked_add(1)
            .expect("event sequence overflowed");
        trace!(at = ?time.epoch(), sequence, ?context, "scheduled event");
        self.alarms.push(Alarm {
            time,
            sequence,
            context,
            event,
        });
    }

    fn release(&mut self, alarm: Alarm<E>) -> Fired<E> {
        self.time = alarm.time;
        self.context = alarm.context;
        self.fired += 1;
        trace!(
            now = ?alarm.time.epoch(),
            sequence = alarm.sequence,
            context = ?alarm.context,
            "released event"
        );
        Fired {
            time: alarm.time,
            context: alarm.context,
            event: alarm.event,
        }
    }
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clock for Scheduler<E> {
    fn current(&self) -> SystemTime {
        self.time
    }
}
