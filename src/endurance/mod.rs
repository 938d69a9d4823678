//! Write-endurance modeling.
//!
//! Non-volatile cells wear out: each partition (by default one bit) has
//! a budget of writes, and a partition whose budget is exhausted
//! becomes a permanent stuck-at fault. Models diff old data against new
//! on every write and charge only the partitions that actually flip.
//!
//! Models are selected by the `EnduranceModel` config key:
//!
//! | key          | granularity                    |
//! |--------------|--------------------------------|
//! | `"BitModel"` | one partition per bit (default granularity 1 bit) |
//! | `"RowModel"` | one partition per device row   |
//! | `""`/`"none"`| endurance disabled             |

pub mod bit_model;
pub mod row_model;

pub use bit_model::BitModel;
pub use row_model::RowModel;

use std::collections::HashMap;

use crate::config::DeviceConfig;
use crate::device::address::MemAddress;
use crate::device::data::DataBlock;
use crate::stats::StatScope;

/// A stuck-at fault created when a partition's write budget ran out.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    /// Faulting coordinate; `address.bit` names the stuck bit and
    /// `address.physical` the faulting byte.
    pub address: MemAddress,
    /// Life-map key of the expired partition.
    pub key: u64,
}

/// A wear model consulted on every leader-bank write.
pub trait EnduranceModel {
    /// Charge the model for a write of `new` over `old` at `address`.
    ///
    /// Returns false when the write touched at least one partition that
    /// is already stuck, i.e. a hard error. The write itself still
    /// completes; faults are diagnostic.
    fn write(&mut self, address: &MemAddress, old: &DataBlock, new: &DataBlock) -> bool;

    /// Remaining writes of the most-worn touched partition.
    fn worst_life(&self) -> Option<u64>;

    /// Mean remaining writes over touched partitions.
    fn average_life(&self) -> Option<f64>;

    /// Partition granularity in bits.
    fn granularity(&self) -> u64;
    fn set_granularity(&mut self, bits: u64);

    fn collect_stats(&self, scope: &mut StatScope);
}

/// Instantiate the model named by the config, if any.
pub fn create_model(cfg: &DeviceConfig) -> Option<Box<dyn EnduranceModel>> {
    match cfg.endurance_model.as_str() {
        "" | "none" | "None" => None,
        "BitModel" => Some(Box::new(BitModel::new(cfg))),
        "RowModel" => Some(Box::new(RowModel::new(cfg))),
        other => {
            log::warn!("unknown endurance model '{}'; endurance disabled", other);
            None
        }
    }
}

/// Shared life bookkeeping: partition key -> remaining writes.
///
/// Keys absent from the map have never been written and hold the full
/// budget implicitly; the first charge inserts them.
#[derive(Debug)]
pub struct LifeMap {
    budget: u64,
    life: HashMap<u64, u64>,
    faults: Vec<FaultRecord>,
    /// Writes that landed on an already-stuck partition.
    dead_writes: u64,
}

impl LifeMap {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            life: HashMap::new(),
            faults: Vec::new(),
            dead_writes: 0,
        }
    }

    /// Charge one write against `key`.
    ///
    /// Returns false when the partition was already stuck. Draining the
    /// last write marks the partition stuck (recording `fault_addr`)
    /// but that write itself still succeeds.
    pub fn decrement(&mut self, key: u64, fault_addr: MemAddress) -> bool {
        let life = self.life.entry(key).or_insert(self.budget);
        if *life == 0 {
            self.dead_writes += 1;
            return false;
        }
        *life -= 1;
        if *life == 0 {
            log::warn!(
                "partition {} exhausted; stuck-at fault at 0x{:X} bit {}",
                key,
                fault_addr.physical,
                fault_addr.bit
            );
            self.faults.push(FaultRecord {
                address: fault_addr,
                key,
            });
        }
        true
    }

    pub fn worst_life(&self) -> Option<u64> {
        self.life.values().min().copied()
    }

    pub fn average_life(&self) -> Option<f64> {
        if self.life.is_empty() {
            return None;
        }
        let sum: u64 = self.life.values().sum();
        Some(sum as f64 / self.life.len() as f64)
    }

    pub fn touched_partitions(&self) -> usize {
        self.life.len()
    }

    pub fn faults(&self) -> &[FaultRecord] {
        &self.faults
    }

    pub fn collect_stats(&self, scope: &mut StatScope) {
        scope.record("touchedPartitions", self.touched_partitions());
        scope.record("stuckAtFaults", self.faults.len());
        scope.record("deadWrites", self.dead_writes);
        match self.worst_life() {
            Some(v) => scope.record("worstCaseEndurance", v),
            None => scope.record("worstCaseEndurance", "N/A"),
        }
        match self.average_life() {
            Some(v) => scope.record("averageEndurance", v),
            None => scope.record("averageEndurance", "N/A"),
        }
    }
}
