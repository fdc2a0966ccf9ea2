//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for glucose meter communication,
//! plus the fixed attribute handles of the reference deployment.

use uuid::Uuid;

// Glucose meter service (16-bit short forms 0xFEE0..0xFEE3 expanded
// onto the Bluetooth base UUID)
/// Glucose meter primary service UUID (0xFEE0).
pub const BGM_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fee0_0000_1000_8000_00805f9b34fb);
/// Passthrough control characteristic UUID (0xFEE1, write).
pub const PASSTHROUGH_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_fee1_0000_1000_8000_00805f9b34fb);
/// Notify characteristic UUID (0xFEE2, notifications from the meter).
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_fee2_0000_1000_8000_00805f9b34fb);
/// Command characteristic UUID (0xFEE3, write to the meter).
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_fee3_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor UUID (0x2902).
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Check if a service UUID is the glucose meter service.
pub fn is_bgm_service(uuid: &Uuid) -> bool {
    *uuid == BGM_SERVICE_UUID
}

/// Attribute handles of the meter's GATT table.
///
/// The reference deployment places the passthrough value at handle 45,
/// the notify value at 48 and the command value at 52. Other firmware
/// revisions may lay the table out differently, so these are carried
/// as configuration rather than hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeterHandles {
    /// Value handle of the passthrough control characteristic (0xFEE1).
    pub passthrough: u16,
    /// Value handle of the notify characteristic (0xFEE2).
    pub notify: u16,
    /// Value handle of the command characteristic (0xFEE3).
    pub write: u16,
}

impl MeterHandles {
    /// Handles observed on the reference meter.
    pub const REFERENCE: Self = Self {
        passthrough: 45,
        notify: 48,
        write: 52,
    };

    /// Declaration handle of the notify characteristic.
    ///
    /// A characteristic value sits one handle past its declaration.
    pub fn notify_declaration(&self) -> u16 {
        self.notify - 1
    }

    /// CCC descriptor handle of the notify characteristic.
    ///
    /// The meter exposes the CCC directly after the value attribute.
    pub fn notify_ccc(&self) -> u16 {
        self.notify + 1
    }

    /// Map a fixed value handle back to its characteristic UUID.
    pub fn characteristic_for(&self, handle: u16) -> Option<Uuid> {
        if handle == self.passthrough {
            Some(PASSTHROUGH_CHARACTERISTIC_UUID)
        } else if handle == self.notify {
            Some(NOTIFY_CHARACTERISTIC_UUID)
        } else if handle == self.write {
            Some(WRITE_CHARACTERISTIC_UUID)
        } else {
            None
        }
    }
}

impl Default for MeterHandles {
    fn default() -> Self {
        Self::REFERENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert!(BGM_SERVICE_UUID.to_string().contains("fee0"));
        assert!(NOTIFY_CHARACTERISTIC_UUID.to_string().contains("fee2"));
        assert!(CCC_DESCRIPTOR_UUID.to_string().contains("2902"));
    }

    #[test]
    fn test_is_bgm_service() {
        assert!(is_bgm_service(&BGM_SERVICE_UUID));
        assert!(!is_bgm_service(&NOTIFY_CHARACTERISTIC_UUID));
    }

    #[test]
    fn test_reference_handles() {
        let handles = MeterHandles::default();
        assert_eq!(handles.passthrough, 45);
        assert_eq!(handles.notify, 48);
        assert_eq!(handles.write, 52);
        assert_eq!(handles.notify_declaration(), 47);
        assert_eq!(handles.notify_ccc(), 49);
    }

    #[test]
    fn test_characteristic_for() {
        let handles = MeterHandles::default();
        assert_eq!(
            handles.characteristic_for(52),
            Some(WRITE_CHARACTERISTIC_UUID)
        );
        assert_eq!(
            handles.characteristic_for(45),
            Some(PASSTHROUGH_CHARACTERISTIC_UUID)
        );
        assert_eq!(handles.characteristic_for(99), None);
    }
}
