//! GATT characteristics read from the pressure sensors.

use uuid::Uuid;

/// Expand a 16-bit Bluetooth SIG assigned number onto the base UUID.
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// GAP Device Name (UTF-8 text).
pub const DEVICE_NAME: Uuid = sig_uuid(0x2A00);

/// Device Information Firmware Revision String (UTF-8 text).
pub const FIRMWARE_REVISION: Uuid = sig_uuid(0x2A26);

/// Vendor pressure reading: little-endian `f32` in reference units.
pub const PRESSURE_READING: Uuid = Uuid::from_u128(0x8d3a_0001_5c1e_4b6f_9d2e_3f1a_7c6b_0e21);

/// Decode a text characteristic. Invalid UTF-8 is replaced and NUL padding removed.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace('\0', "")
        .trim()
        .to_string()
}

pub fn decode_pressure(bytes: &[u8]) -> Option<f64> {
    let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let value = f32::from_le_bytes(raw);
    value.is_finite().then_some(f64::from(value))
}
