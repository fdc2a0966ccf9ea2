//! Error types for the bgm-rust-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this system.
    #[error("Bluetooth is not available")]
    BluetoothUnavailable,

    /// Operation requires a connection but the meter is not connected.
    #[error("Meter not connected")]
    NotConnected,

    /// Failed to establish a connection to the meter.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The batch reassembly buffer is full; the offending byte was dropped.
    #[error("Reassembly buffer overflow (capacity {capacity} bytes)")]
    BufferOverflow {
        /// The fixed capacity of the buffer.
        capacity: usize,
    },

    /// A transport event arrived that is not legal in the current
    /// session state.
    #[error("Illegal transition: {event} while {state}")]
    InvalidTransition {
        /// The session state when the event arrived.
        state: crate::session::SessionState,
        /// The event that could not be applied.
        event: &'static str,
    },

    /// The request channel to the transport driver has closed.
    #[error("Transport driver is no longer running")]
    TransportClosed,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
