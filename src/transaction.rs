use crate::{status::StatusCode, TransactionResult};

/// Direction of a master transaction, the R/W bit of the address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    Write = 0,
    Read = 1,
}

/// When the data phase ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Termination {
    /// Transfer exactly this many bytes.
    FixedLength(u16),
    /// Transfer until a byte equal to this one has gone over the bus.
    Sentinel(u8),
}

#[derive(Debug)]
pub enum Payload<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

impl Payload<'_> {
    pub fn len(&self) -> usize {
        match self {
            Payload::Write(buf) => buf.len(),
            Payload::Read(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One bus operation as master.
///
/// The caller lends the buffer for the transaction's lifetime; the driver only
/// touches it while executing. The outcome is recorded in place.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub(crate) payload: Payload<'a>,
    pub peer_address: u8,
    pub termination: Termination,
    /// Release the bus with STOP when done. With a sentinel write this also
    /// forces the whole payload out even if the sentinel shows up early.
    pub send_stop_after: bool,
    pub(crate) bytes_transferred: u16,
    pub(crate) status: StatusCode,
    pub(crate) outcome: Option<TransactionResult>,
}

impl<'a> Transaction<'a> {
    fn new(peer_address: u8, payload: Payload<'a>) -> Self {
        let length = payload.len().min(u16::MAX as usize) as u16;
        Self {
            payload,
            peer_address,
            termination: Termination::FixedLength(length),
            send_stop_after: true,
            bytes_transferred: 0,
            status: StatusCode::Pending,
            outcome: None,
        }
    }

    /// Sends all of `data` to `peer_address`.
    pub fn write(peer_address: u8, data: &'a [u8]) -> Self {
        Self::new(peer_address, Payload::Write(data))
    }

    /// Fills all of `buf` from `peer_address`.
    pub fn read(peer_address: u8, buf: &'a mut [u8]) -> Self {
        Self::new(peer_address, Payload::Read(buf))
    }

    pub fn fixed_length(mut self, length: u16) -> Self {
        self.termination = Termination::FixedLength(length);
        self
    }

    pub fn terminated_by(mut self, sentinel: u8) -> Self {
        self.termination = Termination::Sentinel(sentinel);
        self
    }

    /// Keeps the bus after the transaction so the next one starts with a
    /// repeated START.
    pub fn without_stop(mut self) -> Self {
        self.send_stop_after = false;
        self
    }

    pub fn direction(&self) -> Direction {
        match self.payload {
            Payload::Write(_) => Direction::Write,
            Payload::Read(_) => Direction::Read,
        }
    }

    /// Address byte: 7-bit address followed by the R/W bit.
    pub fn address_byte(&self) -> u8 {
        (self.peer_address << 1) | self.direction() as u8
    }

    pub fn bytes_transferred(&self) -> u16 {
        self.bytes_transferred
    }

    /// Last hardware status, or a synthetic code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn outcome(&self) -> Option<TransactionResult> {
        self.outcome
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    /// The bytes that went over the bus so far.
    pub fn data(&self) -> &[u8] {
        let n = self.bytes_transferred as usize;
        match &self.payload {
            Payload::Write(buf) => &buf[..n.min(buf.len())],
            Payload::Read(buf) => &buf[..n.min(buf.len())],
        }
    }

    pub(crate) fn restart(&mut self) {
        self.bytes_transferred = 0;
        self.status = StatusCode::Pending;
        self.outcome = None;
    }

    pub(crate) fn finish(&mut self, result: TransactionResult) -> TransactionResult {
        if result.is_ok() {
            self.status = StatusCode::Success;
        }
        self.outcome = Some(result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_full_buffer_with_stop() {
        let data = [1, 2, 3];
        let t = Transaction::write(0x0F, &data);
        assert_eq!(t.termination, Termination::FixedLength(3));
        assert!(t.send_stop_after);
        assert_eq!(t.status(), StatusCode::Pending);
        assert!(!t.is_complete());
    }

    #[test]
    fn address_byte_carries_direction() {
        let mut buf = [0u8; 4];
        assert_eq!(Transaction::write(0x0F, &[]).address_byte(), 0x1E);
        assert_eq!(Transaction::read(0x0F, &mut buf).address_byte(), 0x1F);
    }

    #[test]
    fn builder() {
        let mut buf = [0u8; 12];
        let t = Transaction::read(0x20, &mut buf).terminated_by(0).without_stop();
        assert_eq!(t.direction(), Direction::Read);
        assert_eq!(t.termination, Termination::Sentinel(0));
        assert!(!t.send_stop_after);
    }
}
