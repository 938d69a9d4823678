//! Bit-granularity endurance model.
//!
//! Each row is partitioned into single-bit divisions (configurable via
//! granularity). A write charges exactly the bits that flipped, found
//! by a byte-then-bit diff of the old and new blocks. The partition key
//! packs the full device coordinate of the bit:
//!
//! ```text
//! key = (row + MATHeight * subarray) * (COLS * 8)
//!     + col * wordSize * 8
//!     + byte * 8
//!     + bit
//! ```
//!
//! where `wordSize` is the burst block size in bytes. With granularity
//! `g` bits, keys collapse by integer division so `g` adjacent bits
//! share one life counter.

use crate::config::DeviceConfig;
use crate::device::address::MemAddress;
use crate::device::data::DataBlock;
use crate::stats::StatScope;

use super::{EnduranceModel, LifeMap};

pub struct BitModel {
    life: LifeMap,
    granularity_bits: u64,
    mat_height: u64,
    row_size: u64,
    word_size: u64,
}

impl BitModel {
    pub fn new(cfg: &DeviceConfig) -> Self {
        Self {
            life: LifeMap::new(cfg.endurance_budget),
            granularity_bits: 1,
            mat_height: cfg.mat_height,
            row_size: cfg.cols,
            word_size: cfg.block_bytes() as u64,
        }
    }

    /// Partition key for bit `bit` of byte `byte` of the block at
    /// `address`.
    fn partition_key(&self, address: &MemAddress, byte: u64, bit: u64) -> u64 {
        let partitions_per_row = self.row_size * 8;
        let bit_key = (address.row + self.mat_height * address.subarray) * partitions_per_row
            + address.col * self.word_size * 8
            + byte * 8
            + bit;
        bit_key / self.granularity_bits
    }

    pub fn fault_count(&self) -> usize {
        self.life.faults().len()
    }
}

impl EnduranceModel for BitModel {
    fn write(&mut self, address: &MemAddress, old: &DataBlock, new: &DataBlock) -> bool {
        let mut ok = true;

        for byte in 0..self.word_size {
            let old_byte = old.get_byte(byte as usize);
            let new_byte = new.get_byte(byte as usize);
            if old_byte == new_byte {
                continue;
            }

            for bit in 0..8u64 {
                let old_bit = (old_byte >> bit) & 0x1;
                let new_bit = (new_byte >> bit) & 0x1;
                if old_bit == new_bit {
                    continue;
                }

                log::trace!("bit {} flipped in byte {} of 0x{:X}", bit, byte, address.physical);

                let key = self.partition_key(address, byte, bit);
                let mut fault_addr = *address;
                fault_addr.bit = bit as u8;
                fault_addr.physical = address.physical + byte;
                if !self.life.decrement(key, fault_addr) {
                    ok = false;
                }
            }
        }

        ok
    }

    fn worst_life(&self) -> Option<u64> {
        self.life.worst_life()
    }

    fn average_life(&self) -> Option<f64> {
        self.life.average_life()
    }

    fn granularity(&self) -> u64 {
        self.granularity_bits
    }

    fn set_granularity(&mut self, bits: u64) {
        self.granularity_bits = bits.max(1);
    }

    fn collect_stats(&self, scope: &mut StatScope) {
        self.life.collect_stats(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(budget: u64) -> BitModel {
        let mut cfg = DeviceConfig {
            endurance_budget: budget,
            cols: 1024,
            rows: 8192,
            mat_height: 8192,
            bus_width: 64,
            t_burst: 4,
            rate: 1,
            ..Default::default()
        };
        cfg.sanitize().unwrap();
        BitModel::new(&cfg)
    }

    fn block(model: &BitModel, fill: u8) -> DataBlock {
        DataBlock::from_bytes(vec![fill; model.word_size as usize])
    }

    #[test]
    fn test_no_charge_when_nothing_flips() {
        let mut m = model(10);
        let a = block(&m, 0x5A);
        let b = block(&m, 0x5A);
        assert!(m.write(&MemAddress::default(), &a, &b));
        assert_eq!(m.worst_life(), None);
    }

    #[test]
    fn test_each_flipped_bit_charged_once() {
        let mut m = model(10);
        let old = block(&m, 0x00);
        let new = block(&m, 0x03); // two bits per byte flip
        assert!(m.write(&MemAddress::default(), &old, &new));
        // word_size bytes, 2 bits each
        assert_eq!(m.life.touched_partitions(), m.word_size as usize * 2);
        assert_eq!(m.worst_life(), Some(9));
    }

    #[test]
    fn test_budget_exhaustion_returns_hard_error() {
        // Budget 2: the pattern 00 -> FF -> 00 -> FF flips bit 0 three
        // times; the third flip (fourth write overall) hits a stuck
        // partition.
        let mut m = model(2);
        let zeros = block(&m, 0x00);
        let ones = block(&m, 0xFF);
        let addr = MemAddress::default();

        assert!(m.write(&addr, &zeros, &zeros)); // nothing flips
        assert!(m.write(&addr, &zeros, &ones)); // life 2 -> 1
        assert!(m.write(&addr, &ones, &zeros)); // life 1 -> 0, stuck
        assert!(!m.write(&addr, &zeros, &ones)); // hard error
        assert!(m.fault_count() > 0);
    }

    #[test]
    fn test_fault_records_bit_and_byte() {
        let mut m = model(1);
        let mut old = block(&m, 0x00);
        let mut new = block(&m, 0x00);
        old.set_byte(3, 0x00);
        new.set_byte(3, 0x10); // bit 4 of byte 3
        let addr = MemAddress {
            physical: 0x4000,
            ..Default::default()
        };
        assert!(m.write(&addr, &old, &new));
        let fault = &m.life.faults()[0];
        assert_eq!(fault.address.bit, 4);
        assert_eq!(fault.address.physical, 0x4003);
    }

    #[test]
    fn test_granularity_collapses_keys() {
        let mut m = model(10);
        m.set_granularity(8); // one partition per byte
        let old = block(&m, 0x00);
        let new = block(&m, 0xFF); // all 8 bits of each byte flip
        assert!(m.write(&MemAddress::default(), &old, &new));
        // 8 flips per byte all land on the byte's single partition
        assert_eq!(m.life.touched_partitions(), m.word_size as usize);
        assert_eq!(m.worst_life(), Some(2));
    }

    #[test]
    fn test_distinct_rows_use_distinct_partitions() {
        let mut m = model(10);
        let old = block(&m, 0x00);
        let new = block(&m, 0x01);
        let a0 = MemAddress {
            row: 0,
            ..Default::default()
        };
        let a1 = MemAddress {
            row: 1,
            ..Default::default()
        };
        m.write(&a0, &old, &new);
        m.write(&a1, &old, &new);
        assert_eq!(m.life.touched_partitions(), 2 * m.word_size as usize);
    }
}
