//! Protocol module for the meter's command/response exchange.
//!
//! This module contains the implementations for:
//! - Glucose record bit-unpacking
//! - Batch reassembly
//! - Notification classification and routing
//! - The outbound command catalog

pub mod commands;
pub mod reassembly;
pub mod record;
pub mod router;

pub use commands::{Command, CommandCatalog, ResponseCode};
pub use reassembly::{ReassemblyBuffer, BATCH_BUFFER_CAPACITY};
pub use record::{GlucoseRecord, MealMarker, TimezoneOffset, RECORD_SIZE};
pub use router::{NotificationRouter, RouterEvent, TransferTotals, BATCH_RECORD_COUNT};
