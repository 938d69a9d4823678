//! Physical-address translation.
//!
//! Splits a physical address into (channel, rank, bank, row, col)
//! fields at burst-block granularity, and recomposes it. The mapping is
//! bijective: `compose(translate(a))` returns `a` rounded down to the
//! block size.
//!
//! Field significance is configurable. The default order, least to most
//! significant, is `col, channel, rank, bank, row`, which interleaves
//! consecutive blocks across channels and keeps row bits on top where
//! they stripe least often.

use crate::config::{ConfigError, DeviceConfig};

use super::address::MemAddress;

/// Address fields at translation granularity. Subarray is not a
/// translated field: it is carved out of the row bits afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    Col,
    Channel,
    Rank,
    Bank,
    Row,
}

/// Default field order, least significant first.
pub const DEFAULT_ORDER: [AddressField; 5] = [
    AddressField::Col,
    AddressField::Channel,
    AddressField::Rank,
    AddressField::Bank,
    AddressField::Row,
];

#[derive(Debug, Clone)]
pub struct AddressTranslator {
    block_bytes: u64,
    mat_height: u64,
    order: [AddressField; 5],
    channel_bits: u32,
    rank_bits: u32,
    bank_bits: u32,
    row_bits: u32,
    col_bits: u32,
}

fn field_bits(name: &str, count: u64) -> Result<u32, ConfigError> {
    if !count.is_power_of_two() {
        return Err(ConfigError::Invalid(format!(
            "{} count {} is not a power of two",
            name, count
        )));
    }
    Ok(count.trailing_zeros())
}

impl AddressTranslator {
    pub fn new(cfg: &DeviceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            block_bytes: cfg.block_bytes() as u64,
            mat_height: cfg.mat_height,
            order: DEFAULT_ORDER,
            channel_bits: field_bits("CHANNELS", cfg.channels)?,
            rank_bits: field_bits("RANKS", cfg.ranks)?,
            bank_bits: field_bits("BANKS", cfg.banks)?,
            row_bits: field_bits("ROWS", cfg.rows)?,
            col_bits: field_bits("COLS (burst granularity)", cfg.burst_cols())?,
        })
    }

    /// Override the field order, least significant first.
    pub fn set_order(&mut self, order: [AddressField; 5]) {
        self.order = order;
    }

    fn bits_of(&self, field: AddressField) -> u32 {
        match field {
            AddressField::Col => self.col_bits,
            AddressField::Channel => self.channel_bits,
            AddressField::Rank => self.rank_bits,
            AddressField::Bank => self.bank_bits,
            AddressField::Row => self.row_bits,
        }
    }

    /// Decode a physical byte address into device coordinates.
    pub fn translate(&self, physical: u64) -> MemAddress {
        let mut block = physical / self.block_bytes;
        let mut addr = MemAddress {
            physical,
            ..Default::default()
        };

        for field in self.order {
            let bits = self.bits_of(field);
            let value = block & ((1u64 << bits) - 1);
            block >>= bits;
            match field {
                AddressField::Col => addr.col = value,
                AddressField::Channel => addr.channel = value,
                AddressField::Rank => addr.rank = value,
                AddressField::Bank => addr.bank = value,
                AddressField::Row => {
                    addr.subarray = value / self.mat_height;
                    addr.row = value % self.mat_height;
                }
            }
        }

        addr
    }

    /// Recompose the block-aligned physical address for coordinates.
    pub fn compose(&self, addr: &MemAddress) -> u64 {
        let flat_row = addr.subarray * self.mat_height + addr.row;
        let mut block = 0u64;
        for field in self.order.iter().rev() {
            let bits = self.bits_of(*field);
            let value = match field {
                AddressField::Col => addr.col,
                AddressField::Channel => addr.channel,
                AddressField::Rank => addr.rank,
                AddressField::Bank => addr.bank,
                AddressField::Row => flat_row,
            };
            block = (block << bits) | (value & ((1u64 << bits) - 1));
        }
        block * self.block_bytes
    }
}
