//! Batch reassembly buffer.
//!
//! Eight-record batch transfers arrive split across several
//! notification packets. The bytes are stitched back together in a
//! fixed-capacity buffer before the records are decoded.

use crate::error::{Error, Result};
use crate::protocol::record::{GlucoseRecord, RECORD_SIZE};

/// Capacity of the reassembly buffer: 8 records of 16 bytes plus
/// slack for a partial trailing packet.
pub const BATCH_BUFFER_CAPACITY: usize = 132;

/// Bounded append-only byte accumulator for batch transfers.
///
/// The capacity is fixed; an attempted push past it is rejected with
/// [`Error::BufferOverflow`] rather than growing or panicking. One
/// buffer belongs to exactly one connection session.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    data: [u8; BATCH_BUFFER_CAPACITY],
    len: usize,
}

impl ReassemblyBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            data: [0u8; BATCH_BUFFER_CAPACITY],
            len: 0,
        }
    }

    /// Append one byte, advancing the high-water mark.
    ///
    /// When the buffer is full the byte is dropped and
    /// [`Error::BufferOverflow`] is returned; the condition is
    /// non-fatal and the buffer contents are left untouched.
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= BATCH_BUFFER_CAPACITY {
            return Err(Error::BufferOverflow {
                capacity: BATCH_BUFFER_CAPACITY,
            });
        }

        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Clear contents and high-water mark.
    pub fn reset(&mut self) {
        self.data = [0u8; BATCH_BUFFER_CAPACITY];
        self.len = 0;
    }

    /// Number of accumulated bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The accumulated bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Check whether enough bytes have accumulated to decode
    /// `expected_records` fixed-size records.
    ///
    /// Only the first [`GlucoseRecord::ENCODED_FIELD_BYTES`] bytes of
    /// each 16-byte block carry fields, so the final record does not
    /// need its padding tail to be present.
    pub fn is_complete(&self, expected_records: usize) -> bool {
        let Some(full_blocks) = expected_records.checked_sub(1) else {
            return true;
        };
        self.len >= full_blocks * RECORD_SIZE + GlucoseRecord::ENCODED_FIELD_BYTES
    }

    /// Yield `count` consecutive 16-byte record blocks from the start
    /// of the buffer, zero-padded past the high-water mark.
    ///
    /// The caller is expected to [`reset`](Self::reset) afterwards.
    pub fn drain_records(&self, count: usize) -> Vec<[u8; RECORD_SIZE]> {
        (0..count)
            .map(|i| {
                let mut block = [0u8; RECORD_SIZE];
                let start = i * RECORD_SIZE;
                if start < self.len {
                    let end = (start + RECORD_SIZE).min(self.len);
                    block[..end - start].copy_from_slice(&self.data[start..end]);
                }
                block
            })
            .collect()
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}
