#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(feature = "atmega328p")]
pub mod atmega;
pub mod clock;
mod controller;
mod interrupts;
mod master;
mod queue;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod slave;
pub mod status;
mod stream;
mod transaction;
pub mod twi;

pub use controller::{forward_to, BusController, ReceiveChannel, STATUS_HISTORY_SIZE};
pub use interrupts::{handle_twi_interrupt, InterruptBridge, IDLE_BYTE};
pub use queue::{Drain, QueueFull, TransmissionQueue};
pub use slave::{ReceivedStream, ReceiverState, SlaveReceiver, Step};
pub use status::StatusCode;
pub use stream::GrowableByteStream;
pub use transaction::{Direction, Payload, Termination, Transaction};
pub use twi::Twi;

#[cfg(feature = "dump")]
pub use controller::StatusDump;

/// Lowest and highest assignable 7-bit addresses; the rest are reserved.
pub const MIN_OWN_ADDRESS: u8 = 0x08;
pub const MAX_OWN_ADDRESS: u8 = 0x77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Master only. The slave receiver and the TWI interrupt stay unused.
    Master,
    /// Master that can also be addressed as slave by other masters.
    MultiMaster,
    Slave,
}

impl Role {
    pub fn can_master(self) -> bool {
        !matches!(self, Role::Slave)
    }

    pub fn can_slave(self) -> bool {
        !matches!(self, Role::Master)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// SCL frequency in Hz. Ignored for [`Role::Slave`].
    pub frequency: u32,
    /// Own 7-bit address. Ignored for [`Role::Master`].
    pub own_address: u8,
    pub role: Role,
    pub recognize_general_call: bool,
    /// Maximum number of polls while waiting for the hardware. `None` waits
    /// forever, so a peer that never answers hangs the caller.
    pub wait_budget: Option<u32>,
}

impl BusConfig {
    pub const fn master(frequency: u32) -> Self {
        Self {
            frequency,
            own_address: 0,
            role: Role::Master,
            recognize_general_call: false,
            wait_budget: None,
        }
    }

    pub const fn slave(own_address: u8) -> Self {
        Self {
            frequency: 0,
            own_address,
            role: Role::Slave,
            recognize_general_call: false,
            wait_budget: None,
        }
    }

    pub const fn multi_master(frequency: u32, own_address: u8) -> Self {
        Self {
            frequency,
            own_address,
            role: Role::MultiMaster,
            recognize_general_call: false,
            wait_budget: None,
        }
    }

    pub const fn with_general_call(mut self, on: bool) -> Self {
        self.recognize_general_call = on;
        self
    }

    pub const fn with_wait_budget(mut self, polls: u32) -> Self {
        self.wait_budget = Some(polls);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    InvalidFrequency,
    InvalidAddress,
}

/// Preconditions checked before the bus is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusStateError {
    NotInitialized,
    BusDisabled,
    AckDisabled,
    /// A pure slave was asked to act as master.
    RoleViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArbitrationError {
    /// Another master won the bus.
    Lost,
    /// Another master won the bus and addressed this device. The slave path
    /// has to serve that exchange before the transaction is tried again.
    LostWithAddressMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionError {
    BusState(BusStateError),
    Arbitration(ArbitrationError),
    /// The hardware reported a status the protocol does not allow here.
    UnexpectedState,
    /// The sentinel byte never went over the bus. Transferred data is valid.
    TerminatorNotDetected,
    /// `FixedLength` asks for more bytes than the buffer holds.
    BufferTooShort,
    /// The wait budget ran out before the hardware answered.
    Timeout,
}

impl TransactionError {
    /// Whether a fresh attempt of the same transaction may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TransactionError::Arbitration(ArbitrationError::Lost)
                | TransactionError::UnexpectedState
                | TransactionError::Timeout
        )
    }
}

impl From<BusStateError> for TransactionError {
    fn from(value: BusStateError) -> Self {
        TransactionError::BusState(value)
    }
}

impl From<ArbitrationError> for TransactionError {
    fn from(value: ArbitrationError) -> Self {
        TransactionError::Arbitration(value)
    }
}

pub type TransactionResult = Result<(), TransactionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamError {
    AllocationFailure,
    /// The stream already holds `u16::MAX` bytes.
    Overflow,
}

/// Problems on the slave receive path. There is no caller to return them to,
/// so the controller keeps the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiveFault {
    /// A new address match arrived while a stream was still open.
    Abandoned,
    AllocationFailure,
    Overflow,
    /// Illegal START or STOP on the bus.
    BusError,
}

impl From<StreamError> for ReceiveFault {
    fn from(value: StreamError) -> Self {
        match value {
            StreamError::AllocationFailure => ReceiveFault::AllocationFailure,
            StreamError::Overflow => ReceiveFault::Overflow,
        }
    }
}
