//! Cycle-keyed event queue.
//!
//! Events are scheduled at absolute cycles and fire in insertion order
//! within a cycle. Two kinds exist:
//!
//! - `Cycle`: wakes the target component so it can retry implicit work
//!   (scripted follow-on commands, refresh) at an exact cycle.
//! - `Response`: delivers a completed request back toward its issuing
//!   controller.
//!
//! Targets are explicit component coordinates rather than object
//! pointers; the [`MemorySystem`](crate::system::MemorySystem) root
//! dispatches each popped event to the addressed component.

use std::collections::{BTreeMap, VecDeque};

use super::Cycle;
use crate::device::request::Request;

/// What firing the event means to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Wake the target at this cycle.
    Cycle,
    /// Deliver the carried request as completed.
    Response,
}

/// Component coordinates an event is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Bank { channel: usize, rank: usize, bank: usize },
    Rank { channel: usize, rank: usize },
    Controller { channel: usize },
}

/// A scheduled callback.
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    pub target: EventTarget,
    pub request: Option<Request>,
    /// Insertion sequence number, used to keep same-cycle FIFO order.
    seq: u64,
}

/// Min-ordered queue of events keyed by cycle.
#[derive(Debug, Default)]
pub struct EventQueue {
    current: Cycle,
    next_seq: u64,
    events: BTreeMap<Cycle, VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cycle the simulation is currently executing.
    pub fn current_cycle(&self) -> Cycle {
        self.current
    }

    /// Schedule an event at `cycle`. Scheduling in the past is a logic
    /// error in the caller; the event is clamped to the current cycle so
    /// the simulation stays monotonic.
    pub fn insert(
        &mut self,
        kind: EventKind,
        target: EventTarget,
        request: Option<Request>,
        cycle: Cycle,
    ) {
        let cycle = if cycle < self.current {
            log::warn!(
                "event for {:?} scheduled at past cycle {} (now {}); clamping",
                target,
                cycle,
                self.current
            );
            self.current
        } else {
            cycle
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.entry(cycle).or_default().push_back(Event {
            kind,
            target,
            request,
            seq,
        });
    }

    /// Schedule a wake-up for `target` at `cycle`.
    pub fn insert_wake(&mut self, target: EventTarget, cycle: Cycle) {
        self.insert(EventKind::Cycle, target, None, cycle);
    }

    /// Schedule delivery of a completed `request` at `cycle`.
    pub fn insert_response(&mut self, target: EventTarget, request: Request, cycle: Cycle) {
        self.insert(EventKind::Response, target, Some(request), cycle);
    }

    /// Pop the oldest event due at or before the current cycle.
    pub fn pop_due(&mut self) -> Option<Event> {
        let (&cycle, _) = self.events.iter().next()?;
        if cycle > self.current {
            return None;
        }
        let bucket = self.events.get_mut(&cycle)?;
        let ev = bucket.pop_front();
        if bucket.is_empty() {
            self.events.remove(&cycle);
        }
        ev
    }

    /// Cycle of the earliest pending event, if any.
    pub fn next_event_cycle(&self) -> Option<Cycle> {
        self.events.keys().next().copied()
    }

    /// Advance the clock by `steps` cycles.
    pub fn advance(&mut self, steps: Cycle) {
        self.current += steps;
    }

    /// Jump the clock to the next pending event's cycle.
    ///
    /// Returns false when no events are pending. Events already due are
    /// not skipped: the clock never moves backwards and a jump lands
    /// exactly on the earliest pending cycle.
    pub fn step(&mut self) -> bool {
        match self.next_event_cycle() {
            Some(cycle) => {
                if cycle > self.current {
                    self.current = cycle;
                }
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of pending events, across all cycles.
    pub fn len(&self) -> usize {
        self.events.values().map(|b| b.len()).sum()
    }
}

impl Event {
    /// Insertion order of this event relative to its siblings.
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(bank: usize) -> EventTarget {
        EventTarget::Bank {
            channel: 0,
            rank: 0,
            bank,
        }
    }

    #[test]
    fn test_same_cycle_fifo_order() {
        let mut q = EventQueue::new();
        q.insert_wake(target(0), 5);
        q.insert_wake(target(1), 5);
        q.insert_wake(target(2), 5);

        q.advance(5);
        let order: Vec<_> = std::iter::from_fn(|| q.pop_due())
            .map(|e| e.target)
            .collect();
        assert_eq!(order, vec![target(0), target(1), target(2)]);
    }

    #[test]
    fn test_not_due_until_cycle_reached() {
        let mut q = EventQueue::new();
        q.insert_wake(target(0), 10);

        assert!(q.pop_due().is_none());
        q.advance(9);
        assert!(q.pop_due().is_none());
        q.advance(1);
        assert!(q.pop_due().is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn test_step_jumps_to_next_event() {
        let mut q = EventQueue::new();
        q.insert_wake(target(0), 100);
        assert!(q.step());
        assert_eq!(q.current_cycle(), 100);
        assert!(q.pop_due().is_some());
        assert!(!q.step());
    }

    #[test]
    fn test_past_insert_clamps_to_now() {
        let mut q = EventQueue::new();
        q.advance(50);
        q.insert_wake(target(0), 10);
        assert_eq!(q.next_event_cycle(), Some(50));
    }

    #[test]
    fn test_interleaved_cycles_pop_in_time_order() {
        let mut q = EventQueue::new();
        q.insert_wake(target(2), 7);
        q.insert_wake(target(1), 3);
        q.insert_wake(target(0), 5);

        q.advance(10);
        let order: Vec<_> = std::iter::from_fn(|| q.pop_due())
            .map(|e| e.target)
            .collect();
        assert_eq!(order, vec![target(1), target(0), target(2)]);
    }
}
