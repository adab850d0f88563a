//! BLE Service and Characteristic UUIDs.
//!
//! The controller exposes its telemetry channel behind 16-bit UUID aliases.
//! These constants are the reference deployment's defaults; sessions carry
//! their own copies in configuration, so nothing below is load-bearing for
//! the state machine.

use uuid::Uuid;

/// Expand a 16-bit UUID alias onto the standard Bluetooth base UUID.
pub const fn uuid_from_alias(alias: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | ((alias as u128) << 96))
}

/// Telemetry service advertised by the controller (alias `FFE0`).
pub const FARDRIVER_SERVICE_UUID: Uuid = uuid_from_alias(0xFFE0);

/// Telemetry characteristic carrying frame notifications (alias `FFEC`).
pub const FARDRIVER_CHARACTERISTIC_UUID: Uuid = uuid_from_alias(0xFFEC);

/// Check if a service UUID is the controller's telemetry service.
pub fn is_fardriver_service(uuid: &Uuid) -> bool {
    *uuid == FARDRIVER_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_expansion() {
        assert_eq!(
            FARDRIVER_SERVICE_UUID.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            FARDRIVER_CHARACTERISTIC_UUID.to_string(),
            "0000ffec-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_is_fardriver_service() {
        assert!(is_fardriver_service(&FARDRIVER_SERVICE_UUID));
        assert!(!is_fardriver_service(&FARDRIVER_CHARACTERISTIC_UUID));
        assert!(!is_fardriver_service(&uuid_from_alias(0x180A)));
    }
}
