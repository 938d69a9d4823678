//! The simulated memory system.
//!
//! [`MemorySystem`] is the root object the front end talks to. It owns
//! the channel controllers (each owning its ranks and banks), the
//! event queue, the address translator, the optional data mirror, and
//! any injected observers, and it dispatches popped events to the
//! addressed components.
//!
//! ```text
//!  front end ──issue_command──► MemorySystem
//!                                  │
//!                 ┌────────────────┼────────────────┐
//!            Controller 0     Controller 1      EventQueue
//!             │       │
//!           Rank 0  Rank 1
//!           │    │
//!         Bank0..BankN
//! ```
//!
//! Within a cycle the order is fixed: due events fire first (in
//! insertion order), then each controller schedules and issues, then
//! the device cycles. Completions surface through
//! [`MemorySystem::drain_completions`].

use std::collections::VecDeque;
use std::io::{self, Write};

use thiserror::Error;

use crate::config::{ConfigError, DeviceConfig};
use crate::controller::MemoryController;
use crate::device::data::DataBlock;
use crate::device::request::{OpKind, Request};
use crate::device::translator::AddressTranslator;
use crate::mirror::DataMirror;
use crate::observer::RequestObserver;
use crate::sim::{Cycle, Event, EventKind, EventQueue, EventTarget};
use crate::stats::StatSet;

/// Why a request cannot be admitted right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IssueRefusal {
    #[error("read queue full")]
    ReadQueueFull,
    #[error("write queue full")]
    WriteQueueFull,
    #[error("address outside configured geometry")]
    BadAddress,
}

pub struct MemorySystem {
    cfg: DeviceConfig,
    queue: EventQueue,
    controllers: Vec<MemoryController>,
    translator: AddressTranslator,
    mirror: Option<DataMirror>,
    observers: Vec<Box<dyn RequestObserver>>,
    completed: VecDeque<Request>,
    next_request_id: u64,
    in_flight: u64,
    stat_interval: u64,
}

impl MemorySystem {
    pub fn new(mut cfg: DeviceConfig) -> Result<Self, ConfigError> {
        cfg.sanitize()?;
        let translator = AddressTranslator::new(&cfg)?;

        let mut queue = EventQueue::new();
        let mut controllers: Vec<MemoryController> = (0..cfg.channels as usize)
            .map(|c| MemoryController::new(c, &cfg))
            .collect();
        for controller in &mut controllers {
            controller.prime_refresh(&mut queue);
        }

        let mirror = if cfg.endurance_model.is_empty() {
            None
        } else {
            Some(DataMirror::new(cfg.block_bytes()))
        };

        Ok(Self {
            cfg,
            queue,
            controllers,
            translator,
            mirror,
            observers: Vec::new(),
            completed: VecDeque::new(),
            next_request_id: 1,
            in_flight: 0,
            stat_interval: 0,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn current_cycle(&self) -> Cycle {
        self.queue.current_cycle()
    }

    /// Requests admitted but not yet returned as completions.
    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    pub fn controller(&self, channel: usize) -> &MemoryController {
        &self.controllers[channel]
    }

    /// Inject an observer; it sees every admission and completion.
    pub fn add_observer(&mut self, observer: Box<dyn RequestObserver>) {
        self.observers.push(observer);
    }

    /// Decode a physical address against the configured geometry.
    pub fn translate(&self, physical: u64) -> crate::device::address::MemAddress {
        self.translator.translate(physical)
    }

    /// Whether `req` would be admitted this cycle, with the refusal
    /// reason when not.
    pub fn is_issuable(&self, req: &Request) -> Result<(), IssueRefusal> {
        let address = self.translator.translate(req.address.physical);
        let channel = address.channel as usize;
        if channel >= self.controllers.len() {
            return Err(IssueRefusal::BadAddress);
        }
        let probe = Request::new(req.kind, address);
        if self.controllers[channel].would_refuse(&probe) {
            return Err(match req.kind {
                OpKind::Read => IssueRefusal::ReadQueueFull,
                _ => IssueRefusal::WriteQueueFull,
            });
        }
        Ok(())
    }

    /// Backpressure probe: is any queue that could receive `req` full?
    pub fn queue_full(&self, req: &Request) -> bool {
        let address = self.translator.translate(req.address.physical);
        let channel = address.channel as usize;
        if channel >= self.controllers.len() {
            return true;
        }
        self.controllers[channel].queue_full()
    }

    /// Admit a request into the timing model.
    ///
    /// Reads and writes go through the controller's transaction queues;
    /// other kinds issue directly to the device. Refusal (backpressure
    /// or a device state that cannot accept the command) hands the
    /// request back for retry.
    pub fn issue_command(&mut self, mut req: Request) -> Result<(), Request> {
        req.address = self.translator.translate(req.address.physical);
        if req.id == 0 {
            req.id = self.next_request_id;
            self.next_request_id += 1;
        }

        let channel = req.address.channel as usize;
        if channel >= self.controllers.len() {
            log::warn!("request for unconfigured channel {}", channel);
            return Err(req);
        }

        // Shallow copy for observer notification after the move.
        let mut shadow = Request::new(req.kind, req.address);
        shadow.id = req.id;

        for observer in &mut self.observers {
            observer.pre_issue(&req);
        }

        let now = self.queue.current_cycle();
        let outcome = if req.kind.is_transaction() {
            self.controllers[channel].enqueue(req, now)
        } else {
            let mirror = self.mirror.as_mut();
            self.controllers[channel].issue_direct(req, &mut self.queue, mirror)
        };

        match outcome {
            Ok(()) => {
                for observer in &mut self.observers {
                    observer.post_issue(&shadow, true);
                }
                self.in_flight += 1;
                Ok(())
            }
            Err(req) => {
                for observer in &mut self.observers {
                    observer.post_issue(&req, false);
                }
                Err(req)
            }
        }
    }

    /// Timing-free issue for warm-up: updates the mirror and charges
    /// endurance, touching no queues or bank state.
    pub fn issue_atomic(&mut self, req: &Request) -> bool {
        let address = self.translator.translate(req.address.physical);
        let channel = address.channel as usize;
        if channel >= self.controllers.len() {
            return false;
        }

        match req.kind {
            OpKind::Write => {
                let block_bytes = self.cfg.block_bytes();
                let new = req
                    .data
                    .as_ref()
                    .map(|d| d.resized(block_bytes))
                    .unwrap_or_else(|| DataBlock::zeroed(block_bytes));
                let old = self
                    .mirror
                    .as_ref()
                    .and_then(|m| m.get(address.physical).cloned())
                    .unwrap_or_else(|| DataBlock::zeroed(block_bytes));
                if let Some(mirror) = self.mirror.as_mut() {
                    mirror.set(address.physical, &new);
                }
                let probe = Request::new(OpKind::Write, address);
                self.controllers[channel].atomic_write(&probe, &old, &new);
                true
            }
            OpKind::Read => {
                if let (Some(mirror), Some(data)) = (self.mirror.as_mut(), req.data.as_ref()) {
                    if mirror.get(address.physical).is_none() {
                        mirror.set(address.physical, data);
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Functional issue: data movement only, no timing, no wear.
    pub fn issue_functional(&mut self, req: &Request) -> bool {
        let address = self.translator.translate(req.address.physical);
        match req.kind {
            OpKind::Write => {
                if let (Some(mirror), Some(data)) = (self.mirror.as_mut(), req.data.as_ref()) {
                    mirror.set(address.physical, data);
                }
                true
            }
            OpKind::Read => true,
            _ => false,
        }
    }

    /// Last data recorded for the block containing `physical`, when a
    /// mirror is configured.
    pub fn read_data(&self, physical: u64) -> Option<&DataBlock> {
        self.mirror.as_ref().and_then(|m| m.get(physical))
    }

    /// Advance the simulation by `steps` cycles.
    pub fn cycle(&mut self, steps: u64) {
        for _ in 0..steps {
            while let Some(event) = self.queue.pop_due() {
                self.dispatch(event);
            }

            for c in 0..self.controllers.len() {
                let completed = {
                    let mirror = self.mirror.as_mut();
                    self.controllers[c].cycle(&mut self.queue, mirror)
                };
                for req in completed {
                    self.deliver(req);
                }
            }

            self.queue.advance(1);
        }
    }

    fn dispatch(&mut self, event: Event) {
        match (event.kind, event.target) {
            (EventKind::Cycle, EventTarget::Bank { channel, rank, bank }) => {
                if channel < self.controllers.len() {
                    let mirror = self.mirror.as_mut();
                    self.controllers[channel].wake_bank(rank, bank, &mut self.queue, mirror);
                }
            }
            (EventKind::Response, EventTarget::Rank { channel, rank })
            | (EventKind::Response, EventTarget::Bank { channel, rank, .. }) => {
                // The rank relays completions up to its controller.
                if let Some(req) = event.request {
                    log::trace!("rank {}.{} relaying completion of {}", channel, rank, req.id);
                    self.complete_on(channel, req);
                }
            }
            (EventKind::Response, EventTarget::Controller { channel }) => {
                if let Some(req) = event.request {
                    self.complete_on(channel, req);
                }
            }
            (EventKind::Cycle, _) => {}
        }
    }

    fn complete_on(&mut self, channel: usize, req: Request) {
        if channel >= self.controllers.len() {
            return;
        }
        let now = self.queue.current_cycle();
        if let Some(ext) = self.controllers[channel].request_complete(req, now) {
            self.deliver(ext);
        }
    }

    fn deliver(&mut self, req: Request) {
        for observer in &mut self.observers {
            observer.request_complete(&req);
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        self.completed.push_back(req);
    }

    /// Force buffered writes toward the device regardless of
    /// watermarks, e.g. when the front end is shutting down.
    pub fn drain(&mut self) {
        for controller in &mut self.controllers {
            controller.start_drain();
        }
    }

    /// Take every completion that has surfaced since the last drain.
    pub fn drain_completions(&mut self) -> Vec<Request> {
        self.completed.drain(..).collect()
    }

    /// Gather the full stats tree.
    pub fn collect_stats(&self) -> StatSet {
        let mut set = StatSet::new();
        {
            let mut root = set.scope("");
            root.record("cycles", self.queue.current_cycle());
            root.record("requestsInFlight", self.in_flight);
            for observer in &self.observers {
                observer.collect_stats(&mut root);
            }
            for (c, controller) in self.controllers.iter().enumerate() {
                let mut channel_scope = root.sub(&format!("channel{}", c));
                controller.collect_stats(&mut channel_scope, self.queue.current_cycle());
            }
        }
        set
    }

    /// Print one stats interval and advance the interval counter.
    pub fn print_stats(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let set = self.collect_stats();
        set.print(self.stat_interval, out)?;
        self.stat_interval += 1;
        Ok(())
    }

    pub fn reset_stats(&mut self) {
        for controller in &mut self.controllers {
            controller.reset_stats();
        }
        for observer in &mut self.observers {
            observer.reset_stats();
        }
    }
}
