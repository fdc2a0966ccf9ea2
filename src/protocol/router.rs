//! Notification routing.
//!
//! Classifies inbound notification payloads by their leading response
//! code and turns them into decoded glucose records, reassembling the
//! eight-record batch transfers that arrive split across packets.

use tracing::{debug, info, warn};

use crate::protocol::commands::ResponseCode;
use crate::protocol::reassembly::ReassemblyBuffer;
use crate::protocol::record::{GlucoseRecord, RECORD_SIZE};

/// Number of records in one batch transfer.
pub const BATCH_RECORD_COUNT: usize = 8;
/// Sequence index of the final packet of a batch transfer.
pub const BATCH_TERMINAL_INDEX: u8 = 7;
/// Bytes of response header preceding the record block: code,
/// sequence index, two reserved bytes and the 16-bit record index.
pub const RESPONSE_HEADER_LEN: usize = 6;
/// Bytes of per-packet header on batch continuation packets: code and
/// sequence index only.
pub const PACKET_HEADER_LEN: usize = 2;

/// Scratch length for rendering unrecognized payloads as text.
const DIAGNOSTIC_SCRATCH_LEN: usize = 512;

/// Readout totals reported by the meter in response to a
/// record-count request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferTotals {
    /// Number of records currently stored on the meter.
    pub total_amount: u16,
    /// Capacity of the meter's record store.
    pub max_amount: u16,
    /// Index of the last transferred record.
    pub last_transfer: u16,
}

/// Something the router produced from a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// A decoded glucose reading.
    Record(GlucoseRecord),
    /// A totals header (side observation, not a reading).
    Totals(TransferTotals),
}

/// Classifies notifications and drives record reassembly/decoding.
///
/// The only state mutated is the owned [`ReassemblyBuffer`] and the
/// batch-ready flag; one router belongs to exactly one connection
/// session.
#[derive(Debug, Default)]
pub struct NotificationRouter {
    buffer: ReassemblyBuffer,
    batch_ready: bool,
}

impl NotificationRouter {
    /// Create a router with an empty reassembly buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one notification payload, yielding zero or more
    /// events: usually none or one, and a full batch of records when
    /// the terminal batch packet lands.
    pub fn on_notification(&mut self, payload: &[u8]) -> Vec<RouterEvent> {
        let Some(&code) = payload.first() else {
            warn!("Dropping empty notification payload");
            return Vec::new();
        };

        match ResponseCode::from_raw(code) {
            ResponseCode::SingleRecord => self.on_single_record(payload),
            ResponseCode::EightRecordBatch => self.on_batch_packet(payload),
            other => {
                self.log_diagnostic(other, payload);
                Vec::new()
            }
        }
    }

    /// Drop any partially accumulated batch. Called when the session
    /// resets on disconnect.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.batch_ready = false;
    }

    /// Bytes currently sitting in the reassembly buffer.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Handle a single-record response (0x02).
    ///
    /// The 16-bit record index at bytes 4-5 discriminates the payload
    /// kind: index zero is the totals header answering a
    /// record-count request, anything else carries one record block
    /// starting at byte 6. The sequence byte is not consulted; for
    /// single-record responses it is always 1.
    fn on_single_record(&mut self, payload: &[u8]) -> Vec<RouterEvent> {
        if payload.len() < RESPONSE_HEADER_LEN + GlucoseRecord::ENCODED_FIELD_BYTES {
            warn!(
                "Single-record payload too short to decode: {} bytes",
                payload.len()
            );
            return Vec::new();
        }

        let record_idx = u16::from(payload[5]) << 8 | u16::from(payload[4]);
        debug!("Record index: {:#04x}", record_idx);

        if record_idx == 0 {
            let body = &payload[RESPONSE_HEADER_LEN..];
            let totals = TransferTotals {
                total_amount: u16::from(body[1]) << 8 | u16::from(body[0]),
                max_amount: u16::from(body[3]) << 8 | u16::from(body[2]),
                last_transfer: u16::from(body[5]) << 8 | u16::from(body[4]),
            };
            info!(
                "Readout totals: stored {} of {}, last transfer {:#05x}",
                totals.total_amount, totals.max_amount, totals.last_transfer
            );
            return vec![RouterEvent::Totals(totals)];
        }

        let mut block = [0u8; RECORD_SIZE];
        let body = &payload[RESPONSE_HEADER_LEN..];
        let take = body.len().min(RECORD_SIZE);
        block[..take].copy_from_slice(&body[..take]);

        vec![RouterEvent::Record(GlucoseRecord::decode(&block))]
    }

    /// Handle one packet of an eight-record batch transfer (0x08).
    ///
    /// The first packet (sequence index 1) carries the full 6-byte
    /// response header; continuation packets repeat only the 2-byte
    /// code/sequence prefix. Stripping those keeps the record
    /// boundaries 16-aligned from the start of the buffer. The packet
    /// with the terminal sequence index marks the batch ready.
    fn on_batch_packet(&mut self, payload: &[u8]) -> Vec<RouterEvent> {
        if payload.len() < PACKET_HEADER_LEN {
            warn!(
                "Batch packet too short for a sequence index: {} bytes",
                payload.len()
            );
            return Vec::new();
        }

        let sequence = payload[1];
        if sequence == BATCH_TERMINAL_INDEX {
            self.batch_ready = true;
        }

        let skip = if sequence == 1 {
            RESPONSE_HEADER_LEN
        } else {
            PACKET_HEADER_LEN
        };

        for &byte in payload.iter().skip(skip) {
            if let Err(e) = self.buffer.push(byte) {
                warn!("Can't push to batch buffer: {}", e);
            }
        }

        if !self.batch_ready {
            return Vec::new();
        }

        let events = if self.buffer.is_complete(BATCH_RECORD_COUNT) {
            self.buffer
                .drain_records(BATCH_RECORD_COUNT)
                .iter()
                .map(|block| RouterEvent::Record(GlucoseRecord::decode(block)))
                .collect()
        } else {
            warn!(
                "Batch marked ready with only {} bytes accumulated, dropping",
                self.buffer.len()
            );
            Vec::new()
        };

        self.buffer.reset();
        self.batch_ready = false;
        events
    }

    /// Diagnostic-only path: treat the payload as text, truncated to
    /// the scratch length.
    fn log_diagnostic(&self, code: ResponseCode, payload: &[u8]) {
        let len = payload.len().min(DIAGNOSTIC_SCRATCH_LEN);
        if payload.len() > len {
            info!(
                "Description truncated from {} to {} octets",
                payload.len(),
                len
            );
        }
        info!(
            "Output description ({:?}): {}",
            code,
            String::from_utf8_lossy(&payload[..len])
        );
    }
}
