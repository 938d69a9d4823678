//! Request observers.
//!
//! Observers are injected into the [`MemorySystem`](crate::system::
//! MemorySystem) and invoked around every admission and on every
//! completion. They replace global probe singletons: anything that
//! wants to watch traffic (performance-monitoring counters, debug
//! tracing) gets its own instance with no global state.

use crate::device::request::{OpKind, Request};
use crate::stats::StatScope;

/// Hooks around the request lifecycle. All methods default to no-ops
/// so an observer implements only what it watches.
pub trait RequestObserver {
    /// About to attempt admission of `req`.
    fn pre_issue(&mut self, _req: &Request) {}

    /// Admission attempted; `accepted` is false under backpressure.
    fn post_issue(&mut self, _req: &Request, _accepted: bool) {}

    /// `req` completed and is about to return to its owner.
    fn request_complete(&mut self, _req: &Request) {}

    /// Contribute counters to the stats tree.
    fn collect_stats(&self, _scope: &mut StatScope) {}

    fn reset_stats(&mut self) {}
}

/// Counts admitted and completed reads and writes, in the manner of
/// host-simulator PMU probes.
#[derive(Debug, Default)]
pub struct AccessCounter {
    pub reads_issued: u64,
    pub writes_issued: u64,
    pub reads_completed: u64,
    pub writes_completed: u64,
    pub rejected: u64,
}

impl AccessCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RequestObserver for AccessCounter {
    fn post_issue(&mut self, req: &Request, accepted: bool) {
        if !accepted {
            self.rejected += 1;
            return;
        }
        match req.kind {
            OpKind::Read => self.reads_issued += 1,
            OpKind::Write => self.writes_issued += 1,
            _ => {}
        }
    }

    fn request_complete(&mut self, req: &Request) {
        match req.kind {
            OpKind::Read => self.reads_completed += 1,
            OpKind::Write => self.writes_completed += 1,
            _ => {}
        }
    }

    fn collect_stats(&self, scope: &mut StatScope) {
        let mut pmu = scope.sub("pmu");
        pmu.record("readRequests", self.reads_issued);
        pmu.record("writeRequests", self.writes_issued);
        pmu.record("readsCompleted", self.reads_completed);
        pmu.record("writesCompleted", self.writes_completed);
        pmu.record("rejectedRequests", self.rejected);
    }

    fn reset_stats(&mut self) {
        *self = Self::default();
    }
}
