// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # bgm-rust-ble
//!
//! A cross-platform Rust library for downloading stored readings from
//! BLE blood glucose meters.
//!
//! The meter speaks a vendor passthrough protocol on service `0xFEE0`:
//! after pairing, the client opens passthrough mode, requests the
//! record count and then an eight-record batch, and the meter streams
//! the stored readings back as notifications. This library runs that
//! whole exchange and hands the caller decoded [`GlucoseRecord`]s.
//!
//! ## Features
//!
//! - **Meter Discovery**: Scan for meters advertising the glucose service
//! - **Sequenced Sessions**: Discovery, subscription and command
//!   exchange driven by an explicit state machine
//! - **Record Download**: Reassemble chunked notifications into
//!   complete eight-record batches
//! - **Record Decoding**: Bit-packed timestamps, glucose values, meal
//!   markers and timezone offsets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bgm_rust_ble::{BleScanner, Meter, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Scan for a meter
//!     let scanner = BleScanner::new().await?;
//!     scanner.start_scanning().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     scanner.stop_scanning().await?;
//!
//!     let Some((id, discovered)) = scanner.discovered_meters().into_iter().next() else {
//!         println!("No meter found");
//!         return Ok(());
//!     };
//!     println!("Found meter: {}", id);
//!
//!     // Connect and download the most recent records
//!     let meter = Meter::new(id, discovered.peripheral);
//!     meter.authorize();
//!
//!     let mut records = meter.subscribe_records();
//!     meter.connect().await?;
//!
//!     while let Ok(record) = records.recv().await {
//!         println!("{}", record);
//!     }
//!
//!     meter.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod error;
pub mod meter;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use error::{Error, Result};
pub use meter::{CallbackHandle, Meter};

// Re-export commonly used types from submodules
pub use ble::connection::ConnectionState;
pub use ble::scanner::{BleScanner, MeterDiscoveryEvent};
pub use ble::uuids::MeterHandles;
pub use protocol::{
    GlucoseRecord, MealMarker, NotificationRouter, ResponseCode, RouterEvent, TimezoneOffset,
    TransferTotals,
};
pub use session::{SessionSequencer, SessionState};
