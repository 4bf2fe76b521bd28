//! [`Twi`] over the memory-mapped TWI registers of the ATmega328P.

use core::ptr;

use crate::{
    clock::{Prescaler, DEFAULT_CORE_CLOCK},
    status::STATUS_MASK,
    twi::{Twar, Twcr, Twi},
};

const TWBR: *mut u8 = 0x00B8 as *mut u8;
const TWSR: *mut u8 = 0x00B9 as *mut u8;
const TWAR: *mut u8 = 0x00BA as *mut u8;
const TWDR: *mut u8 = 0x00BB as *mut u8;
const TWCR: *mut u8 = 0x00BC as *mut u8;

/// The single TWI peripheral of the chip.
///
/// Any number of handles may exist; they all address the same registers.
/// Only one [`BusController`](crate::BusController) should own one.
pub struct Atmega328pTwi {
    core_clock: u32,
}

impl Atmega328pTwi {
    pub const fn new(core_clock: u32) -> Self {
        Self { core_clock }
    }
}

impl Default for Atmega328pTwi {
    fn default() -> Self {
        Self::new(DEFAULT_CORE_CLOCK)
    }
}

fn read(reg: *mut u8) -> u8 {
    // SAFETY: fixed I/O register address of the ATmega328P.
    unsafe { ptr::read_volatile(reg) }
}

fn write(reg: *mut u8, value: u8) {
    // SAFETY: fixed I/O register address of the ATmega328P.
    unsafe { ptr::write_volatile(reg, value) }
}

impl Twi for Atmega328pTwi {
    fn core_clock(&self) -> u32 {
        self.core_clock
    }

    fn control(&self) -> Twcr {
        Twcr::from(read(TWCR))
    }

    fn write_control(&self, value: Twcr) {
        write(TWCR, u8::from(value));
    }

    fn status(&self) -> u8 {
        read(TWSR)
    }

    fn data(&self) -> u8 {
        read(TWDR)
    }

    fn write_data(&self, byte: u8) {
        write(TWDR, byte);
    }

    fn address(&self) -> Twar {
        Twar::from(read(TWAR))
    }

    fn write_address(&self, value: Twar) {
        write(TWAR, u8::from(value));
    }

    fn write_bit_rate(&self, divisor: u8, prescaler: Prescaler) {
        // The status bits of TWSR are read-only.
        write(TWSR, (read(TWSR) & STATUS_MASK) | prescaler.index());
        write(TWBR, divisor);
    }
}
