//! Row-granularity endurance model.
//!
//! The coarse sibling of [`BitModel`](super::BitModel): one life
//! counter per device row. A write that changes anything in the block
//! charges the whole row once. Cheap to run on long traces where
//! bit-level wear maps would be enormous.

use crate::config::DeviceConfig;
use crate::device::address::MemAddress;
use crate::device::data::DataBlock;
use crate::stats::StatScope;

use super::{EnduranceModel, LifeMap};

pub struct RowModel {
    life: LifeMap,
    mat_height: u64,
    word_size: u64,
}

impl RowModel {
    pub fn new(cfg: &DeviceConfig) -> Self {
        Self {
            life: LifeMap::new(cfg.endurance_budget),
            mat_height: cfg.mat_height,
            word_size: cfg.block_bytes() as u64,
        }
    }
}

impl EnduranceModel for RowModel {
    fn write(&mut self, address: &MemAddress, old: &DataBlock, new: &DataBlock) -> bool {
        let changed = (0..self.word_size)
            .any(|i| old.get_byte(i as usize) != new.get_byte(i as usize));
        if !changed {
            return true;
        }

        let key = address.row + self.mat_height * address.subarray;
        self.life.decrement(key, *address)
    }

    fn worst_life(&self) -> Option<u64> {
        self.life.worst_life()
    }

    fn average_life(&self) -> Option<f64> {
        self.life.average_life()
    }

    /// Granularity is fixed at one row.
    fn granularity(&self) -> u64 {
        self.mat_height
    }

    fn set_granularity(&mut self, _bits: u64) {}

    fn collect_stats(&self, scope: &mut StatScope) {
        self.life.collect_stats(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(budget: u64) -> RowModel {
        let mut cfg = DeviceConfig {
            endurance_budget: budget,
            ..Default::default()
        };
        cfg.sanitize().unwrap();
        RowModel::new(&cfg)
    }

    #[test]
    fn test_row_charged_once_per_write() {
        let mut m = model(3);
        let old = DataBlock::zeroed(8);
        let new = DataBlock::from_bytes(vec![0xFF; 8]);
        let addr = MemAddress {
            row: 42,
            ..Default::default()
        };
        assert!(m.write(&addr, &old, &new));
        assert_eq!(m.worst_life(), Some(2));
    }

    #[test]
    fn test_unchanged_write_free() {
        let mut m = model(3);
        let data = DataBlock::zeroed(8);
        assert!(m.write(&MemAddress::default(), &data, &data));
        assert_eq!(m.worst_life(), None);
    }

    #[test]
    fn test_row_exhaustion() {
        let mut m = model(1);
        let old = DataBlock::zeroed(8);
        let new = DataBlock::from_bytes(vec![1; 8]);
        let addr = MemAddress::default();
        assert!(m.write(&addr, &old, &new)); // last write, row now stuck
        assert!(!m.write(&addr, &new, &old)); // hard error
    }
}
