use core::cell::RefCell;

use atomic::{Atomic, Ordering};
use critical_section::Mutex;
use heapless::Deque;

/// Mask of the status bits in TWSR. The two low bits are the prescaler.
pub const STATUS_MASK: u8 = 0xF8;

/// TWI status codes.
///
/// The hardware values are the TWSR encodings from the AVR datasheet. The
/// values below 0x08 are never produced by the peripheral and are used by the
/// driver to report its own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::NoUninit)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StatusCode {
    /// Bus error due to an illegal START or STOP condition.
    BusError = 0x00,
    AckDisabled = 0x01,
    BusDisabled = 0x02,
    Pending = 0x03,
    Success = 0x04,

    Start = 0x08,
    RepeatedStart = 0x10,

    MtAddressAck = 0x18,
    MtAddressNack = 0x20,
    MtDataAck = 0x28,
    MtDataNack = 0x30,
    /// Arbitration lost in SLA+R/W or data bytes.
    ArbitrationLost = 0x38,

    MrAddressAck = 0x40,
    MrAddressNack = 0x48,
    MrDataAck = 0x50,
    MrDataNack = 0x58,

    SrAddressAck = 0x60,
    SrArbitrationLostAddressAck = 0x68,
    SrGeneralCallAck = 0x70,
    SrArbitrationLostGeneralCallAck = 0x78,
    SrDataAck = 0x80,
    SrDataNack = 0x88,
    SrGeneralCallDataAck = 0x90,
    SrGeneralCallDataNack = 0x98,
    /// STOP or repeated START received while still addressed as slave.
    SrStopOrRepeatedStart = 0xA0,

    StAddressAck = 0xA8,
    StArbitrationLostAddressAck = 0xB0,
    StDataAck = 0xB8,
    StDataNack = 0xC0,
    StLastDataAck = 0xC8,

    /// No relevant state information, TWINT is not set.
    NoInfo = 0xF8,
}

impl StatusCode {
    /// Statuses the slave receiver state machine reacts to.
    pub fn is_slave_receive(self) -> bool {
        matches!(
            self,
            Self::SrAddressAck
                | Self::SrArbitrationLostAddressAck
                | Self::SrGeneralCallAck
                | Self::SrArbitrationLostGeneralCallAck
                | Self::SrDataAck
                | Self::SrDataNack
                | Self::SrGeneralCallDataAck
                | Self::SrGeneralCallDataNack
                | Self::SrStopOrRepeatedStart
        )
    }

    pub fn is_slave_transmit(self) -> bool {
        matches!(
            self,
            Self::StAddressAck
                | Self::StArbitrationLostAddressAck
                | Self::StDataAck
                | Self::StDataNack
                | Self::StLastDataAck
        )
    }

    /// Arbitration was lost and the hardware was addressed as slave in the
    /// same address phase.
    pub fn is_arbitration_lost_addressed(self) -> bool {
        matches!(
            self,
            Self::SrArbitrationLostAddressAck
                | Self::SrArbitrationLostGeneralCallAck
                | Self::StArbitrationLostAddressAck
        )
    }
}

impl From<StatusCode> for u8 {
    fn from(value: StatusCode) -> Self {
        value as u8
    }
}

/// Decodes a raw TWSR value.
///
/// Unknown encodings map to [`StatusCode::NoInfo`]; callers must not advance
/// their state on it.
pub fn decode(raw: u8) -> StatusCode {
    match raw & STATUS_MASK {
        0x00 => StatusCode::BusError,
        0x08 => StatusCode::Start,
        0x10 => StatusCode::RepeatedStart,
        0x18 => StatusCode::MtAddressAck,
        0x20 => StatusCode::MtAddressNack,
        0x28 => StatusCode::MtDataAck,
        0x30 => StatusCode::MtDataNack,
        0x38 => StatusCode::ArbitrationLost,
        0x40 => StatusCode::MrAddressAck,
        0x48 => StatusCode::MrAddressNack,
        0x50 => StatusCode::MrDataAck,
        0x58 => StatusCode::MrDataNack,
        0x60 => StatusCode::SrAddressAck,
        0x68 => StatusCode::SrArbitrationLostAddressAck,
        0x70 => StatusCode::SrGeneralCallAck,
        0x78 => StatusCode::SrArbitrationLostGeneralCallAck,
        0x80 => StatusCode::SrDataAck,
        0x88 => StatusCode::SrDataNack,
        0x90 => StatusCode::SrGeneralCallDataAck,
        0x98 => StatusCode::SrGeneralCallDataNack,
        0xA0 => StatusCode::SrStopOrRepeatedStart,
        0xA8 => StatusCode::StAddressAck,
        0xB0 => StatusCode::StArbitrationLostAddressAck,
        0xB8 => StatusCode::StDataAck,
        0xC0 => StatusCode::StDataNack,
        0xC8 => StatusCode::StLastDataAck,
        _ => StatusCode::NoInfo,
    }
}

/// Most recent status plus a short trail of the ones before it. Written by
/// the master engine and the interrupt vector alike.
pub(crate) struct StatusLog<const N: usize> {
    last: Atomic<StatusCode>,
    trail: Mutex<RefCell<Deque<StatusCode, N>>>,
}

impl<const N: usize> StatusLog<N> {
    pub const fn new() -> Self {
        Self {
            last: Atomic::new(StatusCode::NoInfo),
            trail: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    pub fn record(&self, status: StatusCode) {
        critical_section::with(|cs| {
            let mut trail = self.trail.borrow_ref_mut(cs);
            if trail.is_full() {
                trail.pop_front();
            }
            trail.push_back(status).ok();
            self.last.store(status, Ordering::SeqCst);
        });
    }

    pub fn last(&self) -> StatusCode {
        self.last.load(Ordering::SeqCst)
    }

    /// The trail oldest first, right-aligned and padded with `NoInfo`.
    #[cfg_attr(not(feature = "dump"), allow(dead_code))]
    pub fn snapshot(&self) -> [StatusCode; N] {
        let mut out = [StatusCode::NoInfo; N];
        critical_section::with(|cs| {
            let trail = self.trail.borrow_ref(cs);
            let start = N - trail.len();
            for (slot, status) in out[start..].iter_mut().zip(trail.iter()) {
                *slot = *status;
            }
        });
        out
    }
}
