//! BLE communication module.
//!
//! This module provides low-level Bluetooth Low Energy functionality
//! for finding and talking to blood glucose meters.

pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use scanner::BleScanner;
pub use transport::{RequestQueue, TransportRequest};
pub use uuids::*;
