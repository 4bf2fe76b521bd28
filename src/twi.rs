//! TWI register model and the hardware seam used by the driver.
//!
//! Register layout follows the ATmega328P datasheet, section "2-wire Serial
//! Interface". Only TWCR and TWAR are modelled as bitfields; TWSR is decoded
//! by [`crate::status::decode`] and TWDR/TWBR are plain bytes.

use bilge::prelude::*;

use crate::clock::Prescaler;

#[bitsize(8)]
#[derive(Clone, Copy, DebugBits, FromBits)]
/// TWCR – TWI Control Register.
pub struct Twcr {
    /// Interrupt enable. The vector fires while TWINT is high.
    pub twie: bool,
    _reserved: bool,
    /// Enables the TWI and hands the SCL/SDA pins to it.
    pub twen: bool,
    /// Write collision: TWDR written while TWINT was low.
    pub twwc: bool,
    /// Generate a STOP condition. Cleared by hardware once executed.
    pub twsto: bool,
    /// Generate a START (or repeated START) condition.
    pub twsta: bool,
    /// Acknowledge own address, general call and received data bytes.
    pub twea: bool,
    /// Set by hardware when the current job is done. Written as one to clear
    /// it, which starts the next operation.
    pub twint: bool,
}

#[bitsize(8)]
#[derive(Clone, Copy, DebugBits, FromBits)]
/// TWAR – TWI (Slave) Address Register.
pub struct Twar {
    /// Recognise the general call address (0x00).
    pub twgce: bool,
    pub twa: u7,
}

impl Twar {
    pub fn with_address(address: u8, general_call: bool) -> Self {
        let mut twar = Twar::from(0u8);
        twar.set_twa(u7::new(address & 0x7F));
        twar.set_twgce(general_call);
        twar
    }

    pub fn address(&self) -> u8 {
        self.twa().value()
    }
}

/// Access to one TWI peripheral.
///
/// All methods take `&self`: the registers are shared between foreground code
/// and the interrupt vector, exactly like memory-mapped I/O.
pub trait Twi {
    /// Clock feeding the bit rate generator, in Hz.
    fn core_clock(&self) -> u32;

    fn control(&self) -> Twcr;

    /// Writes TWCR. Writing `twint = true` clears the flag and starts the
    /// next bus operation; writing `twint = false` leaves the flag untouched.
    fn write_control(&self, value: Twcr);

    /// Raw TWSR, prescaler bits included.
    fn status(&self) -> u8;

    fn data(&self) -> u8;

    fn write_data(&self, byte: u8);

    fn address(&self) -> Twar;

    fn write_address(&self, value: Twar);

    fn write_bit_rate(&self, divisor: u8, prescaler: Prescaler);

    /// Read-modify-write of TWCR that never clears TWINT by accident.
    fn modify_control(&self, f: impl FnOnce(&mut Twcr)) {
        let mut w = self.control();
        w.set_twint(false);
        f(&mut w);
        self.write_control(w);
    }

    /// Busy-waits for TWINT. Returns `false` if `budget` polls elapsed first.
    fn wait_for_flag(&self, budget: Option<u32>) -> bool {
        wait_until(budget, || self.control().twint())
    }

    /// Busy-waits until the hardware has executed a requested STOP.
    fn wait_for_stop(&self, budget: Option<u32>) -> bool {
        wait_until(budget, || !self.control().twsto())
    }
}

fn wait_until(budget: Option<u32>, mut done: impl FnMut() -> bool) -> bool {
    let mut remaining = budget;
    while !done() {
        match remaining.as_mut() {
            Some(0) => return false,
            Some(n) => *n -= 1,
            None => {}
        }
        core::hint::spin_loop();
    }
    true
}
