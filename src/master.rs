use crate::{
    status::{self, StatusCode, StatusLog},
    transaction::{Payload, Termination, Transaction},
    twi::{Twcr, Twi},
    ArbitrationError, TransactionError, TransactionResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Phase {
    Idle,
    StartSent,
    AddressSent,
    DataPhase,
    Done,
}

/// Drives one transaction to completion by polling TWINT.
///
/// The TWI interrupt must be masked while the engine runs; every command it
/// writes keeps TWIE cleared.
pub(crate) struct MasterEngine<'t, T: Twi, const H: usize> {
    twi: &'t T,
    history: &'t StatusLog<H>,
    wait_budget: Option<u32>,
    phase: Phase,
}

impl<'t, T: Twi, const H: usize> MasterEngine<'t, T, H> {
    pub fn new(twi: &'t T, history: &'t StatusLog<H>, wait_budget: Option<u32>) -> Self {
        Self {
            twi,
            history,
            wait_budget,
            phase: Phase::Idle,
        }
    }

    /// How far the last transaction got.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn execute(&mut self, txn: &mut Transaction) -> TransactionResult {
        txn.restart();
        self.phase = Phase::Idle;

        let address_byte = txn.address_byte();
        let Transaction {
            payload,
            termination,
            send_stop_after,
            bytes_transferred,
            status,
            ..
        } = txn;

        let result = self.run_phases(
            address_byte,
            payload,
            *termination,
            *send_stop_after,
            bytes_transferred,
            status,
        );

        #[cfg(feature = "defmt")]
        if let Err(e) = result {
            defmt::debug!(
                "twi: {:?} in {:?} after {} bytes, status {:?}",
                e,
                self.phase,
                *bytes_transferred,
                *status
            );
        }

        if result.is_ok() {
            self.phase = Phase::Done;
        }
        result
    }

    /// Ends the bus side of a finished transaction.
    ///
    /// Returns `true` if the bus is still held, which happens only for a
    /// successful transaction without STOP. `rearm` turns the TWI interrupt
    /// back on for the slave path.
    pub fn conclude(&self, result: &TransactionResult, send_stop_after: bool, rearm: bool) -> bool {
        match result {
            Ok(()) if !send_stop_after => true,
            Err(TransactionError::Arbitration(ArbitrationError::LostWithAddressMatch)) if rearm => {
                // TWINT stays set, the interrupt vector picks up the address match.
                self.twi.modify_control(|w| w.set_twie(true));
                false
            }
            Err(TransactionError::Arbitration(_)) => {
                // The hardware already dropped to slave mode. Clearing TWINT
                // releases the bus without a STOP.
                let mut w = self.command(|_| {});
                w.set_twie(rearm);
                self.twi.write_control(w);
                false
            }
            _ => {
                let mut w = self.command(|w| w.set_twsto(true));
                w.set_twie(rearm);
                self.twi.write_control(w);
                if !self.twi.wait_for_stop(self.wait_budget) {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("twi: STOP did not complete");
                }
                false
            }
        }
    }

    fn run_phases(
        &mut self,
        address_byte: u8,
        payload: &mut Payload,
        termination: Termination,
        send_stop_after: bool,
        count: &mut u16,
        status: &mut StatusCode,
    ) -> TransactionResult {
        self.start(status)?;
        self.address(address_byte, status)?;

        self.phase = Phase::DataPhase;
        match payload {
            Payload::Write(data) => self.transmit(data, termination, send_stop_after, count, status),
            Payload::Read(buf) => self.receive(buf, termination, count, status),
        }
    }

    fn start(&mut self, status: &mut StatusCode) -> TransactionResult {
        let s = self.step(status, |w| w.set_twsta(true))?;
        self.phase = Phase::StartSent;
        match s {
            StatusCode::Start | StatusCode::RepeatedStart => Ok(()),
            s => Err(arbitration_or_unexpected(s)),
        }
    }

    fn address(&mut self, address_byte: u8, status: &mut StatusCode) -> TransactionResult {
        self.twi.write_data(address_byte);
        let s = self.step(status, |_| {})?;
        self.phase = Phase::AddressSent;

        let expected = if address_byte & 1 == 0 {
            StatusCode::MtAddressAck
        } else {
            StatusCode::MrAddressAck
        };
        if s == expected {
            Ok(())
        } else {
            Err(arbitration_or_unexpected(s))
        }
    }

    fn transmit(
        &mut self,
        data: &[u8],
        termination: Termination,
        full_length: bool,
        count: &mut u16,
        status: &mut StatusCode,
    ) -> TransactionResult {
        let (length, sentinel) = match termination {
            Termination::FixedLength(n) => (n as usize, None),
            Termination::Sentinel(s) => (data.len().min(u16::MAX as usize), Some(s)),
        };

        let data = data.get(..length).ok_or(TransactionError::BufferTooShort)?;
        for &byte in data {
            self.twi.write_data(byte);
            match self.step(status, |_| {})? {
                StatusCode::MtDataAck => {}
                s => return Err(arbitration_or_unexpected(s)),
            }
            *count += 1;

            if !full_length && sentinel == Some(byte) {
                return Ok(());
            }
        }

        match sentinel {
            Some(_) if !full_length => Err(TransactionError::TerminatorNotDetected),
            _ => Ok(()),
        }
    }

    fn receive(
        &mut self,
        buf: &mut [u8],
        termination: Termination,
        count: &mut u16,
        status: &mut StatusCode,
    ) -> TransactionResult {
        let (length, sentinel) = match termination {
            Termination::FixedLength(n) => (n as usize, None),
            Termination::Sentinel(s) => (buf.len().min(u16::MAX as usize), Some(s)),
        };

        let buf = buf
            .get_mut(..length)
            .ok_or(TransactionError::BufferTooShort)?;
        for (i, slot) in buf.iter_mut().enumerate() {
            // The last byte the buffer allows is NACKed so the peer stops
            // driving the bus.
            let last = i + 1 == length;
            match self.step(status, |w| w.set_twea(!last))? {
                StatusCode::MrDataAck => {}
                StatusCode::MrDataNack if last => {}
                s => return Err(arbitration_or_unexpected(s)),
            }

            let byte = self.twi.data();
            *slot = byte;
            *count += 1;

            if sentinel == Some(byte) {
                return Ok(());
            }
        }

        match sentinel {
            Some(_) => Err(TransactionError::TerminatorNotDetected),
            None => Ok(()),
        }
    }

    /// Issues a command, waits for the hardware and records the status.
    fn step(
        &mut self,
        status: &mut StatusCode,
        f: impl FnOnce(&mut Twcr),
    ) -> Result<StatusCode, TransactionError> {
        self.twi.write_control(self.command(f));

        let mut budget = self.wait_budget;
        loop {
            if !self.twi.wait_for_flag(budget) {
                return Err(TransactionError::Timeout);
            }
            match status::decode(self.twi.status()) {
                // TWINT is up but TWSR has not caught up yet.
                StatusCode::NoInfo => match budget.as_mut() {
                    Some(0) => return Err(TransactionError::Timeout),
                    Some(n) => *n -= 1,
                    None => {}
                },
                s => {
                    *status = s;
                    self.history.record(s);
                    return Ok(s);
                }
            }
        }
    }

    /// TWCR value that clears TWINT with the interrupt masked.
    fn command(&self, f: impl FnOnce(&mut Twcr)) -> Twcr {
        let mut w = Twcr::from(0u8);
        w.set_twen(true);
        // Starting a transaction requires acknowledge to be enabled.
        w.set_twea(true);
        f(&mut w);
        w.set_twint(true);
        w
    }
}

fn arbitration_or_unexpected(status: StatusCode) -> TransactionError {
    if status == StatusCode::ArbitrationLost {
        ArbitrationError::Lost.into()
    } else if status.is_arbitration_lost_addressed() {
        ArbitrationError::LostWithAddressMatch.into()
    } else {
        TransactionError::UnexpectedState
    }
}
