//! Rank aggregation and rank-global constraints.
//!
//! A rank is an ordered set of banks sharing a data bus and a command
//! budget. The rank enforces what no single bank can see:
//!
//! - `tRRD`: minimum spacing between activates to any two banks,
//! - `tFAW`: at most four activates within any `tFAW` window,
//! - bus occupancy: after any burst, sibling banks' read/write marks
//!   are pushed past the bus turnaround.
//!
//! Every successful bank op updates the shared [`RankTiming`] channel;
//! issuability checks consult it. Completions relay upward through the
//! rank to the issuing controller.

use std::collections::VecDeque;

use crate::config::DeviceConfig;
use crate::mirror::DataMirror;
use crate::sim::{Cycle, EventQueue, EventTarget};
use crate::stats::StatScope;

use super::bank::{Bank, BankId, BankState};
use super::request::{OpKind, Owner, Request};

/// Rank-level timing constraints shared by sibling banks.
#[derive(Debug)]
pub struct RankTiming {
    t_rrd: u64,
    t_faw: u64,
    next_activate: Cycle,
    /// Cycles of the most recent activates, at most four deep.
    act_window: VecDeque<Cycle>,
    /// Cycle the shared data bus frees up.
    bus_busy_until: Cycle,
    bursts: u64,
}

impl RankTiming {
    pub fn new(cfg: &DeviceConfig) -> Self {
        Self {
            t_rrd: cfg.t_rrd,
            t_faw: cfg.t_faw,
            next_activate: 0,
            act_window: VecDeque::with_capacity(4),
            bus_busy_until: 0,
            bursts: 0,
        }
    }

    /// Whether an activate may issue at `cycle` under tRRD and tFAW.
    pub fn activate_allowed(&self, cycle: Cycle) -> bool {
        if cycle < self.next_activate {
            return false;
        }
        if self.act_window.len() == 4 {
            if let Some(&oldest) = self.act_window.front() {
                if cycle < oldest + self.t_faw {
                    return false;
                }
            }
        }
        true
    }

    pub fn record_activate(&mut self, cycle: Cycle) {
        self.next_activate = self.next_activate.max(cycle + self.t_rrd);
        self.act_window.push_back(cycle);
        if self.act_window.len() > 4 {
            self.act_window.pop_front();
        }
    }

    pub fn record_bus_read(&mut self, cycle: Cycle) {
        self.bus_busy_until = self.bus_busy_until.max(cycle);
        self.bursts += 1;
    }

    pub fn record_bus_write(&mut self, cycle: Cycle) {
        self.bus_busy_until = self.bus_busy_until.max(cycle);
        self.bursts += 1;
    }
}

pub struct Rank {
    channel: usize,
    index: usize,
    cfg: DeviceConfig,
    banks: Vec<Bank>,
    timing: RankTiming,
}

impl Rank {
    pub fn new(channel: usize, index: usize, cfg: &DeviceConfig) -> Self {
        let banks = (0..cfg.banks as usize)
            .map(|bank| {
                Bank::new(
                    BankId {
                        channel,
                        rank: index,
                        bank,
                    },
                    cfg,
                )
            })
            .collect();
        Self {
            channel,
            index,
            cfg: cfg.clone(),
            banks,
            timing: RankTiming::new(cfg),
        }
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    pub fn bank(&self, bank: usize) -> &Bank {
        &self.banks[bank]
    }

    pub fn target(&self) -> EventTarget {
        EventTarget::Rank {
            channel: self.channel,
            rank: self.index,
        }
    }

    /// Schedule wake-ups for every bank's first refresh.
    pub fn prime_refresh(&mut self, queue: &mut EventQueue) {
        if !self.cfg.use_refresh {
            return;
        }
        for bank in &self.banks {
            queue.insert_wake(
                EventTarget::Bank {
                    channel: self.channel,
                    rank: self.index,
                    bank: bank.id().bank,
                },
                bank.next_refresh_cycle(),
            );
        }
    }

    /// Whether `req` could issue on its target bank `delay` cycles
    /// from now, under bank and rank constraints.
    pub fn is_issuable(&mut self, req: &Request, delay: Cycle, now: Cycle) -> bool {
        let bank = req.address.bank as usize;
        if bank >= self.banks.len() {
            return false;
        }
        self.banks[bank].is_issuable(req, delay, &self.timing, now)
    }

    /// Issue a command to its target bank.
    ///
    /// On success, bus-sharing constraints propagate to sibling banks.
    /// Refusal hands the request back unchanged.
    pub fn issue(
        &mut self,
        req: Request,
        queue: &mut EventQueue,
        mirror: Option<&mut DataMirror>,
    ) -> Result<(), Request> {
        let bank = req.address.bank as usize;
        if bank >= self.banks.len() {
            log::warn!(
                "rank {}: request for out-of-range bank {}",
                self.index,
                bank
            );
            return Err(req);
        }

        let now = queue.current_cycle();
        let timing = &mut self.timing;

        match req.kind {
            OpKind::Activate => self.banks[bank].activate(req, timing, queue),
            OpKind::Read => {
                self.banks[bank].read(req, timing, queue, mirror)?;
                for (i, sibling) in self.banks.iter_mut().enumerate() {
                    if i != bank {
                        sibling.note_sibling_read(now);
                    }
                }
                Ok(())
            }
            OpKind::Write => {
                self.banks[bank].write(req, timing, queue, mirror)?;
                for (i, sibling) in self.banks.iter_mut().enumerate() {
                    if i != bank {
                        sibling.note_sibling_write(now);
                    }
                }
                Ok(())
            }
            OpKind::Precharge => self.banks[bank].precharge(req, queue),
            OpKind::Refresh => {
                if self.banks[bank].refresh(queue) {
                    self.complete_immediate(req, queue);
                    Ok(())
                } else {
                    Err(req)
                }
            }
            OpKind::PowerDownFast | OpKind::PowerDownSlow | OpKind::PowerDownActive => {
                let state = match req.kind {
                    OpKind::PowerDownFast => BankState::PowerDownPrechargeFast,
                    OpKind::PowerDownSlow => BankState::PowerDownPrechargeSlow,
                    _ => BankState::PowerDownActive,
                };
                if self.banks[bank].power_down(state, now) {
                    self.complete_immediate(req, queue);
                    Ok(())
                } else {
                    Err(req)
                }
            }
            OpKind::PowerUp => self.banks[bank].power_up(req, queue),
        }
    }

    fn complete_immediate(&self, req: Request, queue: &mut EventQueue) {
        match req.owner {
            Owner::External => {
                let now = queue.current_cycle();
                queue.insert_response(self.target(), req, now);
            }
            Owner::Controller => log::trace!("rank {}: internal {:?} done", self.index, req.kind),
        }
    }

    /// Cycle every bank; returns completions that matured.
    pub fn cycle(
        &mut self,
        steps: u64,
        queue: &mut EventQueue,
        mut mirror: Option<&mut DataMirror>,
    ) -> Vec<Request> {
        self.coordinate_refresh(queue);

        let mut matured = Vec::new();
        let timing = &mut self.timing;
        for bank in &mut self.banks {
            matured.extend(bank.cycle(steps, timing, queue, mirror.as_deref_mut()));
        }
        matured
    }

    /// Event-queue wake-up for one bank.
    pub fn wake_bank(
        &mut self,
        bank: usize,
        queue: &mut EventQueue,
        mirror: Option<&mut DataMirror>,
    ) {
        if bank < self.banks.len() {
            self.banks[bank].wake(&mut self.timing, queue, mirror);
        }
    }

    /// Rank-wide refresh: when every bank is due (or deferring) and
    /// closed, fire them together so the rank refreshes as a unit.
    fn coordinate_refresh(&mut self, queue: &mut EventQueue) {
        if !(self.cfg.use_refresh && self.cfg.rank_refresh) {
            return;
        }
        let now = queue.current_cycle();
        let all_due = self
            .banks
            .iter()
            .all(|b| b.refresh_due(now) || b.refresh_pending());
        let all_closed = self.banks.iter().all(|b| b.state() == BankState::Closed);
        if all_due && all_closed {
            for bank in &mut self.banks {
                bank.refresh(queue);
            }
        }
    }

    pub fn idle(&self, now: Cycle) -> bool {
        self.banks.iter().all(|b| b.idle(now))
    }

    /// Atomic (timing-free) endurance charge, for warm-up.
    pub fn atomic_write(
        &mut self,
        bank: usize,
        address: &crate::device::address::MemAddress,
        old: &crate::device::data::DataBlock,
        new: &crate::device::data::DataBlock,
    ) -> bool {
        if bank >= self.banks.len() {
            return false;
        }
        self.banks[bank].atomic_write(address, old, new)
    }

    pub fn collect_stats(&self, scope: &mut StatScope, now: Cycle) {
        let total_power: f64 = self.banks.iter().map(|b| b.power(now)).sum();
        scope.record_units("power", total_power, Some("W"));
        scope.record("bursts", self.timing.bursts);

        for (i, bank) in self.banks.iter().enumerate() {
            let mut bank_scope = scope.sub(&format!("bank{}", i));
            bank.collect_stats(&mut bank_scope, now);
        }
    }

    pub fn reset_stats(&mut self) {
        self.timing.bursts = 0;
        for bank in &mut self.banks {
            bank.reset_stats();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::address::MemAddress;
    use crate::device::request::Request;
    use crate::sim::EventKind;

    fn test_cfg() -> DeviceConfig {
        let mut cfg = DeviceConfig {
            channels: 1,
            ranks: 1,
            banks: 4,
            rows: 1024,
            cols: 64,
            bus_width: 64,
            t_burst: 4,
            rate: 1,
            t_rcd: 10,
            t_ras: 20,
            t_rp: 10,
            t_cas: 5,
            t_cwd: 4,
            t_wr: 6,
            t_wtr: 3,
            t_ccd: 4,
            t_al: 0,
            t_rtp: 1,
            t_rrdr: 1,
            t_rrd: 2,
            t_faw: 30,
            ..Default::default()
        };
        cfg.sanitize().unwrap();
        cfg
    }

    fn addr(bank: u64, row: u64) -> MemAddress {
        MemAddress {
            bank,
            row,
            ..Default::default()
        }
    }

    #[test]
    fn test_trrd_spaces_activates() {
        let cfg = test_cfg();
        let mut timing = RankTiming::new(&cfg);

        assert!(timing.activate_allowed(0));
        timing.record_activate(0);
        // tRRD = 2: next activate no earlier than cycle 2.
        assert!(!timing.activate_allowed(1));
        assert!(timing.activate_allowed(2));
    }

    #[test]
    fn test_tfaw_window_limits_four_activates() {
        let cfg = test_cfg();
        let mut timing = RankTiming::new(&cfg);

        for cycle in [0u64, 4, 8, 12] {
            assert!(timing.activate_allowed(cycle), "act at {}", cycle);
            timing.record_activate(cycle);
        }
        // Four activates in the window; the fifth waits for
        // window[0] + tFAW = 30.
        assert!(!timing.activate_allowed(16));
        assert!(!timing.activate_allowed(29));
        assert!(timing.activate_allowed(30));
    }

    #[test]
    fn test_bus_turnaround_propagates_to_siblings() {
        let cfg = test_cfg();
        let mut rank = Rank::new(0, 0, &cfg);
        let mut q = EventQueue::new();

        // Open rows on banks 0 and 1.
        rank.issue(Request::internal(OpKind::Activate, addr(0, 0)), &mut q, None)
            .unwrap();
        q.advance(2);
        rank.issue(Request::internal(OpKind::Activate, addr(1, 0)), &mut q, None)
            .unwrap();

        // Bank 0 reads at 12; bank 1 could read at 12 on its own
        // timing but the shared bus holds it to 12 + tBURST = 16.
        q.advance(10);
        rank.issue(Request::new(OpKind::Read, addr(0, 0)), &mut q, None)
            .unwrap();

        let probe = Request::new(OpKind::Read, addr(1, 0));
        assert!(!rank.is_issuable(&probe, 0, q.current_cycle()));
        q.advance(4);
        assert!(rank.is_issuable(&probe, 0, q.current_cycle()));
    }

    #[test]
    fn test_read_response_relayed_through_rank() {
        let cfg = test_cfg();
        let mut rank = Rank::new(0, 0, &cfg);
        let mut q = EventQueue::new();

        rank.issue(Request::internal(OpKind::Activate, addr(2, 7)), &mut q, None)
            .unwrap();
        q.advance(10);
        rank.issue(Request::new(OpKind::Read, addr(2, 7)), &mut q, None)
            .unwrap();

        // Response addressed to this rank at 10 + tCAS + tBURST.. = 19.
        q.advance(9);
        let ev = q.pop_due().expect("response");
        assert_eq!(ev.kind, EventKind::Response);
        assert_eq!(
            ev.target,
            EventTarget::Rank {
                channel: 0,
                rank: 0
            }
        );
    }

    #[test]
    fn test_out_of_range_bank_refused() {
        let cfg = test_cfg();
        let mut rank = Rank::new(0, 0, &cfg);
        let mut q = EventQueue::new();
        let req = Request::internal(OpKind::Activate, addr(99, 0));
        assert!(rank.issue(req, &mut q, None).is_err());
    }

    #[test]
    fn test_rank_wide_refresh_fires_together() {
        let mut cfg = test_cfg();
        cfg.use_refresh = true;
        cfg.rank_refresh = true;
        cfg.refresh_rows = 4;
        cfg.t_rfi = 256 * 20; // interval = 20
        cfg.t_rfc = 5;
        cfg.sanitize().unwrap();

        let mut rank = Rank::new(0, 0, &cfg);
        let mut q = EventQueue::new();

        q.advance(20);
        rank.cycle(1, &mut q, None);

        // Every bank refreshed in the same cycle: activates blocked for
        // refreshRows * tRFC = 20 cycles on all of them.
        for bank in 0..rank.bank_count() {
            let probe = Request::internal(OpKind::Activate, addr(bank as u64, 0));
            assert!(!rank.is_issuable(&probe, 0, q.current_cycle()));
        }
    }
}
