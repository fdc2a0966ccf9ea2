//! Outbound command catalog and response codes.
//!
//! The meter speaks a small scripted command set: a passthrough-mode
//! opener plus two record-readout requests, each targeting a fixed
//! attribute handle. Payloads never change at runtime.

use crate::ble::uuids::MeterHandles;

/// First byte of every inbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    /// Firmware version report (0x01).
    FirmwareVersion = 0x01,
    /// Single glucose record or readout totals header (0x02).
    SingleRecord = 0x02,
    /// One packet of an eight-record batch transfer (0x08).
    EightRecordBatch = 0x08,
    /// Serial number report (0x0B).
    SerialNumber = 0x0B,
    /// Any code the meter is not documented to send.
    Unknown = 0xFF,
}

impl ResponseCode {
    /// Create from the raw leading payload byte.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x01 => Self::FirmwareVersion,
            0x02 => Self::SingleRecord,
            0x08 => Self::EightRecordBatch,
            0x0B => Self::SerialNumber,
            _ => Self::Unknown,
        }
    }

    /// Convert to the raw byte value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }
}

/// Payload that switches the meter into passthrough mode.
pub const OPEN_PASSTHROUGH_PAYLOAD: [u8; 1] = [0x00];
/// Payload requesting the stored-record count totals.
pub const REQUEST_COUNT_PAYLOAD: [u8; 5] = [0xB0, 0x61, 0x00, 0x00, 0x11];
/// Payload requesting an eight-record batch readout.
pub const REQUEST_BATCH_PAYLOAD: [u8; 5] = [0xB0, 0x62, 0x08, 0x00, 0x1A];

/// One outbound command: a payload and the attribute handle it
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Attribute handle the payload is written to.
    pub handle: u16,
    /// The command bytes.
    pub payload: &'static [u8],
}

/// Static table of the meter's outbound commands, bound to a handle
/// configuration. Entries are immutable once built.
#[derive(Debug, Clone, Copy)]
pub struct CommandCatalog {
    handles: MeterHandles,
}

impl CommandCatalog {
    /// Build the catalog for a handle configuration.
    pub fn new(handles: MeterHandles) -> Self {
        Self { handles }
    }

    /// Open passthrough mode, enabling the command/response exchange.
    pub fn open_passthrough(&self) -> Command {
        Command {
            handle: self.handles.passthrough,
            payload: &OPEN_PASSTHROUGH_PAYLOAD,
        }
    }

    /// Ask the meter how many records it holds; answered by a
    /// single-record totals header.
    pub fn request_count(&self) -> Command {
        Command {
            handle: self.handles.write,
            payload: &REQUEST_COUNT_PAYLOAD,
        }
    }

    /// Ask the meter for the next eight records; answered by a batch
    /// transfer split across several notifications.
    pub fn request_batch(&self) -> Command {
        Command {
            handle: self.handles.write,
            payload: &REQUEST_BATCH_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_from_raw() {
        assert_eq!(ResponseCode::from_raw(0x01), ResponseCode::FirmwareVersion);
        assert_eq!(ResponseCode::from_raw(0x02), ResponseCode::SingleRecord);
        assert_eq!(ResponseCode::from_raw(0x08), ResponseCode::EightRecordBatch);
        assert_eq!(ResponseCode::from_raw(0x0B), ResponseCode::SerialNumber);
        assert_eq!(ResponseCode::from_raw(0x42), ResponseCode::Unknown);
    }

    #[test]
    fn test_catalog_targets_configured_handles() {
        let catalog = CommandCatalog::new(MeterHandles::default());

        let open = catalog.open_passthrough();
        assert_eq!(open.handle, 45);
        assert_eq!(open.payload, &[0x00]);

        let count = catalog.request_count();
        assert_eq!(count.handle, 52);
        assert_eq!(count.payload, &[0xB0, 0x61, 0x00, 0x00, 0x11]);

        let batch = catalog.request_batch();
        assert_eq!(batch.handle, 52);
        assert_eq!(batch.payload, &[0xB0, 0x62, 0x08, 0x00, 0x1A]);
    }

    #[test]
    fn test_catalog_respects_custom_handles() {
        let handles = MeterHandles {
            passthrough: 20,
            notify: 23,
            write: 27,
        };
        let catalog = CommandCatalog::new(handles);
        assert_eq!(catalog.open_passthrough().handle, 20);
        assert_eq!(catalog.request_count().handle, 27);
    }
}
