//! This module decodes the instrument status byte and the standard event register.
//!
//! The meaning of each status byte bit differs between instrument families, so the bit positions are
//! never hard-coded in the dialogue logic. They live in a [`StatusBitmasks`] table that is handed to
//! the session when it is built.

use modular_bitfield::prelude::*;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display, EnumCount as EnumCountMacro, EnumIter};

use crate::clock::Millis;

/// Snapshot of the 8-bit status byte, captured once per dialogue turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusByte(u8);

impl StatusByte {
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw register value.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// True if any bit of `mask` is set.
    pub const fn intersects(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }
}

impl From<u8> for StatusByte {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<StatusByte> for u8 {
    fn from(value: StatusByte) -> Self {
        value.0
    }
}

impl core::fmt::Display for StatusByte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Named conditions which can be reported through the status byte.
#[derive(Debug, Display, EnumIter, EnumCountMacro, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum ConditionBit {
    /// MSB: an enabled measurement event occurred.
    MeasurementEvent = 0,
    /// SSB: an enabled system event occurred.
    SystemEvent = 1,
    /// EAV: the error queue is not empty.
    ErrorAvailable = 2,
    /// QSB: an enabled questionable event occurred.
    QuestionableEvent = 3,
    /// MAV: a reply is waiting in the output queue.
    MessageAvailable = 4,
    /// ESB: an enabled standard event occurred.
    EventSummary = 5,
    /// MSS/RQS: the instrument is requesting service.
    RequestingService = 6,
    /// OSB: an enabled operation event occurred.
    OperationEvent = 7,
    /// Bit which signals that a pending operation complete request was honoured.
    OperationComplete = 8,
}

/// Per-family table mapping each [`ConditionBit`] to its status byte mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBitmasks {
    masks: [u8; ConditionBit::COUNT],
}

impl Default for StatusBitmasks {
    fn default() -> Self {
        Self::ieee488()
    }
}

impl StatusBitmasks {
    /// IEEE 488.2 layout as used by TSP and SCPI instruments.
    ///
    /// Operation complete is reported as a service request, which holds when the standard event
    /// enable register selects OPC and the service request enable register selects ESB.
    pub const fn ieee488() -> Self {
        Self {
            masks: [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x40],
        }
    }

    /// Replace the mask used for `bit`.
    pub const fn with_mask(mut self, bit: ConditionBit, mask: u8) -> Self {
        self.masks[bit as usize] = mask;
        self
    }

    /// Mask of a single condition.
    pub const fn mask(&self, bit: ConditionBit) -> u8 {
        self.masks[bit as usize]
    }

    /// Combined mask of several conditions.
    pub fn mask_of(&self, bits: &[ConditionBit]) -> u8 {
        bits.iter().fold(0, |acc, bit| acc | self.mask(*bit))
    }

    /// Decode a status byte into the set of conditions it reports.
    pub fn decode(&self, status: StatusByte) -> Conditions {
        ConditionBit::iter()
            .filter(|bit| self.is_set(status, *bit))
            .fold(Conditions::default(), |set, bit| set.with(bit))
    }

    /// Check a single condition against a status byte.
    pub const fn is_set(&self, status: StatusByte, bit: ConditionBit) -> bool {
        let mask = self.mask(bit);
        mask != 0 && status.intersects(mask)
    }
}

/// Set of conditions decoded from one status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Conditions(u16);

impl Conditions {
    pub const fn with(self, bit: ConditionBit) -> Self {
        Self(self.0 | (1 << bit as u16))
    }

    pub const fn contains(&self, bit: ConditionBit) -> bool {
        self.0 & (1 << bit as u16) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ConditionBit> + '_ {
        ConditionBit::iter().filter(|bit| self.contains(*bit))
    }
}

/// Result of a bounded wait for status conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwaitOutcome {
    /// The predicate was not observed before the timeout elapsed.
    pub timed_out: bool,
    /// Last status byte read.
    pub status: StatusByte,
    /// Time spent waiting.
    pub elapsed: Millis,
}

/// IEEE 488.2 standard event status register.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardEvents {
    pub operation_complete: bool,
    pub request_control: bool,
    pub query_error: bool,
    pub device_error: bool,
    pub execution_error: bool,
    pub command_error: bool,
    pub user_request: bool,
    pub power_on: bool,
}

impl StandardEvents {
    pub fn from_register(value: u8) -> Self {
        Self::from_bytes([value])
    }

    /// True if any of the error events is latched.
    pub fn has_errors(&self) -> bool {
        self.query_error() || self.device_error() || self.execution_error() || self.command_error()
    }
}
