//! Discrete-event simulation core.
//!
//! A single event queue owns simulation time. Components never run in
//! parallel; concurrency is modeled as interleaving on the shared cycle
//! counter, and only advancing the queue moves time forward.

pub mod event_queue;

pub use event_queue::{Event, EventKind, EventQueue, EventTarget};

/// Simulation time in device clock cycles.
pub type Cycle = u64;
