use alloc::vec::Vec;

use crate::StreamError;

/// Byte buffer for a stream of unknown final length.
///
/// Capacity doubles when a byte is pushed into a full buffer and only shrinks
/// through [`trim`](Self::trim). Growth is fallible and all-or-nothing: if the
/// allocator refuses, the stream keeps its old buffer and contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowableByteStream {
    buf: Vec<u8>,
    capacity: u16,
}

impl GrowableByteStream {
    pub const INITIAL_CAPACITY: u16 = 8;

    pub fn new() -> Result<Self, StreamError> {
        Self::with_capacity(Self::INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: u16) -> Result<Self, StreamError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity as usize)
            .map_err(|_| StreamError::AllocationFailure)?;
        Ok(Self { buf, capacity })
    }

    pub fn push(&mut self, byte: u8) -> Result<(), StreamError> {
        if self.len() == u16::MAX {
            return Err(StreamError::Overflow);
        }
        if self.len() == self.capacity {
            self.grow()?;
        }
        self.buf.push(byte);
        Ok(())
    }

    fn grow(&mut self) -> Result<(), StreamError> {
        let capacity = match self.capacity {
            0 => Self::INITIAL_CAPACITY,
            c => c.saturating_mul(2),
        };
        self.buf
            .try_reserve_exact(capacity as usize - self.buf.len())
            .map_err(|_| StreamError::AllocationFailure)?;
        self.capacity = capacity;
        Ok(())
    }

    /// Reallocates the buffer to exactly [`len`](Self::len) bytes.
    pub fn trim(&mut self) {
        self.buf.shrink_to_fit();
        self.capacity = self.len();
    }

    pub fn len(&self) -> u16 {
        self.buf.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Room left before the next push has to grow the buffer.
    pub fn remaining(&self) -> u16 {
        self.capacity - self.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl AsRef<[u8]> for GrowableByteStream {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
