//! Memory requests and command scripts.

use smallvec::SmallVec;

use crate::sim::Cycle;

use super::address::MemAddress;
use super::data::DataBlock;

/// Device command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Activate,
    Precharge,
    Refresh,
    /// Fast-exit precharge power-down.
    PowerDownFast,
    /// Slow-exit precharge power-down.
    PowerDownSlow,
    /// Active (row open) power-down.
    PowerDownActive,
    PowerUp,
}

impl OpKind {
    pub fn is_power_down(self) -> bool {
        matches!(
            self,
            OpKind::PowerDownFast | OpKind::PowerDownSlow | OpKind::PowerDownActive
        )
    }

    /// Read and write are the transaction kinds the controller queues;
    /// everything else is a device maintenance command.
    pub fn is_transaction(self) -> bool {
        matches!(self, OpKind::Read | OpKind::Write)
    }
}

/// Who allocated the request and is owed its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The front end (host simulator or trace reader).
    External,
    /// The controller, for commands it synthesizes (ACT/PRE/refresh).
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    Issued,
    Complete,
}

/// Follow-on commands a bank consumes one at a time after the carrying
/// request's own command succeeds.
///
/// Each step is re-scheduled on the event queue at the follow-on's
/// earliest legal cycle, so a compound like `Read + [Precharge,
/// PowerDownFast]` closes the row and powers the bank down as soon as
/// timing admits, without controller involvement.
#[derive(Debug, Clone, Default)]
pub struct CommandScript {
    steps: SmallVec<[OpKind; 4]>,
}

impl CommandScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: &[OpKind]) -> Self {
        Self {
            steps: SmallVec::from_slice(steps),
        }
    }

    pub fn push(&mut self, kind: OpKind) {
        self.steps.push(kind);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Pop the next step, validating it can be bank-issued implicitly.
    ///
    /// Refresh and power-up cannot appear inside a script (refresh is
    /// bank-initiated, power-up must come from outside the powered-down
    /// bank); hitting one truncates the remainder with a warning.
    pub fn next_step(&mut self) -> Option<OpKind> {
        if self.steps.is_empty() {
            return None;
        }
        let kind = self.steps.remove(0);
        match kind {
            OpKind::Read
            | OpKind::Write
            | OpKind::Activate
            | OpKind::Precharge
            | OpKind::PowerDownFast
            | OpKind::PowerDownSlow
            | OpKind::PowerDownActive => Some(kind),
            other => {
                log::warn!("unsupported scripted command {:?}; dropping remainder", other);
                self.steps.clear();
                None
            }
        }
    }
}

/// A memory request flowing through the controller and device.
#[derive(Debug)]
pub struct Request {
    /// Identifier assigned at admission, for front-end correlation.
    pub id: u64,
    pub kind: OpKind,
    pub address: MemAddress,
    pub data: Option<DataBlock>,
    pub script: CommandScript,
    pub owner: Owner,
    pub arrival_cycle: Cycle,
    pub issue_cycle: Cycle,
    pub completion_cycle: Cycle,
    pub status: RequestStatus,
}

impl Request {
    pub fn new(kind: OpKind, address: MemAddress) -> Self {
        Self {
            id: 0,
            kind,
            address,
            data: None,
            script: CommandScript::new(),
            owner: Owner::External,
            arrival_cycle: 0,
            issue_cycle: 0,
            completion_cycle: 0,
            status: RequestStatus::Queued,
        }
    }

    /// A controller-synthesized command inheriting `address`.
    pub fn internal(kind: OpKind, address: MemAddress) -> Self {
        let mut req = Self::new(kind, address);
        req.owner = Owner::Controller;
        req
    }

    pub fn with_data(mut self, data: DataBlock) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_script(mut self, script: CommandScript) -> Self {
        self.script = script;
        self
    }
}
