//! BLE Service and Characteristic UUIDs.
//!
//! Contains the identifiers advertised by the fall-detection wearable.

use uuid::Uuid;

/// Fall-detection service UUID advertised by the wearable.
pub const FALL_SERVICE_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_56789abcdef0);

/// Fall/proximity event characteristic UUID (Notify).
pub const FALL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x1234_5678_1234_5678_1234_56789abcdef2);

/// Advertised local name of the stock wearable firmware.
pub const PERIPHERAL_NAME: &str = "Nano33BLE-Fall";
