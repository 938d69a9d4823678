//! Device model: addresses, data blocks, requests, banks, ranks.
//!
//! The timing hierarchy mirrors the physical part:
//!
//! ```text
//! channel ── rank ── bank ── row / col
//! ```
//!
//! Banks own the per-command earliest-legal-cycle state machine
//! ([`bank`]); ranks add the constraints banks share ([`rank`]);
//! [`translator`] maps flat physical addresses onto the hierarchy.

pub mod address;
pub mod bank;
pub mod data;
pub mod rank;
pub mod request;
pub mod translator;

pub use address::MemAddress;
pub use bank::{Bank, BankId, BankState, EnergyCounters};
pub use data::DataBlock;
pub use rank::{Rank, RankTiming};
pub use request::{CommandScript, OpKind, Owner, Request, RequestStatus};
pub use translator::{AddressField, AddressTranslator};
