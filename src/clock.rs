use crate::ConfigError;

/// Core clock of the reference board.
pub const DEFAULT_CORE_CLOCK: u32 = 16_000_000;

/// TWI bit rate prescaler, selected by the TWPS bits of TWSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Prescaler {
    Div1 = 0,
    Div4 = 1,
    Div16 = 2,
    Div64 = 3,
}

impl Prescaler {
    pub const ALL: [Prescaler; 4] = [Self::Div1, Self::Div4, Self::Div16, Self::Div64];

    /// Value of the TWPS1:TWPS0 bits.
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn value(self) -> u32 {
        match self {
            Self::Div1 => 1,
            Self::Div4 => 4,
            Self::Div16 => 16,
            Self::Div64 => 64,
        }
    }

    pub fn from_index(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Div1,
            1 => Self::Div4,
            2 => Self::Div16,
            _ => Self::Div64,
        }
    }
}

/// Computes the TWBR divisor and prescaler for an SCL frequency.
///
/// SCL = core_clock / (16 + 2 * TWBR * prescaler), so
/// TWBR * prescaler = core_clock / (2 * frequency) - 8. The smallest prescaler
/// that brings the divisor into `0..=255` wins.
pub fn compute(core_clock: u32, frequency: u32) -> Result<(u8, Prescaler), ConfigError> {
    if frequency == 0 {
        return Err(ConfigError::InvalidFrequency);
    }

    let half_period = core_clock / frequency.saturating_mul(2);
    let raw = half_period
        .checked_sub(8)
        .ok_or(ConfigError::InvalidFrequency)?;

    Prescaler::ALL
        .into_iter()
        .find(|p| raw / p.value() <= 255)
        .map(|p| ((raw / p.value()) as u8, p))
        .ok_or(ConfigError::InvalidFrequency)
}

/// SCL frequency produced by a divisor/prescaler pair.
pub fn scl_frequency(core_clock: u32, divisor: u8, prescaler: Prescaler) -> u32 {
    core_clock / (16 + 2 * divisor as u32 * prescaler.value())
}
