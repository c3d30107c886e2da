//! Receive accumulator.

use crate::connector::Connector;
use std::io;

/// Default accumulator size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Default upper bound for a single read.
pub const DEFAULT_MAX_READ: usize = 1024;

/// Bytes received but not yet parsed, bounded by `capacity`.
///
/// Parsed responses are shifted out from the front; the rest stays for the
/// next parse attempt.
#[derive(Debug)]
pub struct RxBuffer {
    data: Vec<u8>,
    capacity: usize,
    max_read: usize,
}

impl RxBuffer {
    pub fn new(capacity: usize, max_read: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            max_read: max_read.clamp(1, capacity),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    /// Performs one read into the free space. Returns the connector result.
    pub fn fill_from(&mut self, connector: &dyn Connector) -> io::Result<usize> {
        let room = (self.capacity - self.data.len()).min(self.max_read);
        if room == 0 {
            return Ok(0);
        }
        let start = self.data.len();
        self.data.resize(start + room, 0);
        let result = connector.read(&mut self.data[start..]);
        let read = *result.as_ref().unwrap_or(&0);
        self.data.truncate(start + read);
        result
    }

    /// Appends bytes, dropping whatever does not fit. Returns how many were kept.
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let kept = bytes.len().min(self.capacity - self.data.len());
        self.data.extend_from_slice(&bytes[..kept]);
        kept
    }

    /// Drops the first `end` bytes.
    pub fn consume(&mut self, end: usize) {
        let end = end.min(self.data.len());
        self.data.drain(..end);
    }

    /// Empties the buffer and returns how many bytes were thrown away.
    pub fn discard(&mut self) -> usize {
        let discarded = self.data.len();
        self.data.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_keeps_remainder() {
        let mut buf = RxBuffer::new(16, 8);
        assert_eq!(buf.extend(b"OK\r\nBUSY"), 8);
        buf.consume(4);
        assert_eq!(buf.as_slice(), b"BUSY");
        buf.consume(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let mut buf = RxBuffer::new(4, 8);
        assert_eq!(buf.extend(b"abcdef"), 4);
        assert!(buf.is_full());
        assert_eq!(buf.discard(), 4);
        assert!(!buf.is_full());
    }
}
