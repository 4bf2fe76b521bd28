use alloc::vec::Vec;

use crate::{status::StatusCode, stream::GrowableByteStream, ReceiveFault};

/// A finished slave receive, handed to the subscriber by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedStream {
    stream: GrowableByteStream,
    general_call: bool,
}

impl ReceivedStream {
    pub fn as_slice(&self) -> &[u8] {
        self.stream.as_slice()
    }

    pub fn len(&self) -> u16 {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Whether the remote master used the general call address.
    pub fn is_general_call(&self) -> bool {
        self.general_call
    }

    pub fn stream(&self) -> &GrowableByteStream {
        &self.stream
    }

    pub fn into_stream(self) -> GrowableByteStream {
        self.stream
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.stream.into_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiverState {
    Idle,
    AddressMatched,
    Receiving,
    /// The last stream was handed off.
    Complete,
    /// A fault dropped the stream; bytes are NACKed until the next STOP.
    Discarding,
}

/// What the interrupt vector has to do after one event.
#[derive(Debug, Default)]
pub struct Step {
    pub completed: Option<ReceivedStream>,
    pub fault: Option<ReceiveFault>,
    /// Acknowledge the next byte.
    pub ack: bool,
}

impl Step {
    fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }

    fn nack() -> Self {
        Self::default()
    }
}

/// Slave receiver state machine, fed one TWI status per interrupt.
///
/// The receiver owns the stream being filled; a finished stream leaves it by
/// move, and the next address match always starts a new allocation.
#[derive(Debug)]
pub struct SlaveReceiver {
    state: ReceiverState,
    stream: Option<GrowableByteStream>,
    general_call: bool,
}

impl SlaveReceiver {
    pub const fn new() -> Self {
        Self {
            state: ReceiverState::Idle,
            stream: None,
            general_call: false,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Bytes collected so far in the open stream.
    pub fn pending_len(&self) -> u16 {
        self.stream.as_ref().map_or(0, GrowableByteStream::len)
    }

    pub fn on_event(&mut self, status: StatusCode, byte: u8) -> Step {
        match status {
            StatusCode::SrAddressAck | StatusCode::SrArbitrationLostAddressAck => {
                self.address_matched(false)
            }
            StatusCode::SrGeneralCallAck | StatusCode::SrArbitrationLostGeneralCallAck => {
                self.address_matched(true)
            }
            StatusCode::SrDataAck | StatusCode::SrGeneralCallDataAck => self.byte_received(byte),
            StatusCode::SrDataNack | StatusCode::SrGeneralCallDataNack => {
                // The hardware leaves addressed mode after returning NACK, no
                // STOP event follows.
                let mut step = self.byte_received(byte);
                if step.fault.is_none() {
                    step.completed = self.complete();
                }
                step.ack = true;
                step
            }
            StatusCode::SrStopOrRepeatedStart => self.stopped(),
            _ => Step::ack(),
        }
    }

    /// Drops the open stream, if any. Returns the fault to report for it.
    pub fn reset(&mut self) -> Option<ReceiveFault> {
        let fault = self.stream.take().map(|_| ReceiveFault::Abandoned);
        self.state = ReceiverState::Idle;
        fault
    }

    fn address_matched(&mut self, general_call: bool) -> Step {
        let abandoned = self.reset();

        match GrowableByteStream::new() {
            Ok(stream) => {
                self.stream = Some(stream);
                self.general_call = general_call;
                self.state = ReceiverState::AddressMatched;
                Step {
                    fault: abandoned,
                    ..Step::ack()
                }
            }
            Err(e) => {
                self.state = ReceiverState::Discarding;
                Step {
                    fault: Some(e.into()),
                    ..Step::nack()
                }
            }
        }
    }

    fn byte_received(&mut self, byte: u8) -> Step {
        let Some(stream) = self.stream.as_mut() else {
            return match self.state {
                ReceiverState::Discarding => Step::nack(),
                _ => Step::ack(),
            };
        };

        match stream.push(byte) {
            Ok(()) => {
                self.state = ReceiverState::Receiving;
                Step {
                    // NACK the byte that will fill the stream to its limit.
                    ack: stream.len() < u16::MAX - 1,
                    ..Step::default()
                }
            }
            Err(e) => {
                self.stream = None;
                self.state = ReceiverState::Discarding;
                Step {
                    fault: Some(e.into()),
                    ..Step::nack()
                }
            }
        }
    }

    fn stopped(&mut self) -> Step {
        match self.state {
            ReceiverState::AddressMatched | ReceiverState::Receiving => Step {
                completed: self.complete(),
                ..Step::ack()
            },
            ReceiverState::Discarding => {
                self.state = ReceiverState::Idle;
                Step::ack()
            }
            ReceiverState::Idle | ReceiverState::Complete => Step::ack(),
        }
    }

    fn complete(&mut self) -> Option<ReceivedStream> {
        let mut stream = self.stream.take()?;
        stream.trim();
        self.state = ReceiverState::Complete;
        Some(ReceivedStream {
            stream,
            general_call: self.general_call,
        })
    }
}

impl Default for SlaveReceiver {
    fn default() -> Self {
        Self::new()
    }
}
