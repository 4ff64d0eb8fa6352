use crate::{
    error::{MifloraError, Result},
    types::{SensorReading, VersionBattery},
};
use bytes::Buf;

/// Minimum length of a version-battery payload: battery byte, separator byte, one version char
pub const VERSION_BATTERY_MIN_LEN: usize = 3;

/// Minimum length of a sensor-data payload
///
/// The device sends 16 bytes; only the first 10 carry data.
pub const SENSOR_DATA_MIN_LEN: usize = 10;

/// Magic value written to the mode-change characteristic before reading live data
pub const MODE_CHANGE_COMMAND: [u8; 2] = [0xA0, 0x1F];

/// First firmware version that needs a mode change before the sensor data is current
pub const MODE_CHANGE_MIN_FIRMWARE: &str = "2.6.6";

/// Parse the version-battery characteristic
///
/// Layout:
/// - Byte 0: battery level in percent
/// - Byte 1: unused
/// - Bytes 2..: firmware version as ASCII, e.g. `2.7.0`
///
/// # Errors
///
/// Returns [`MifloraError::Read`] if the payload is shorter than
/// [`VERSION_BATTERY_MIN_LEN`].
pub fn parse_version_battery(data: &[u8]) -> Result<VersionBattery> {
    if data.len() < VERSION_BATTERY_MIN_LEN {
        return Err(MifloraError::Read(format!(
            "Version battery payload too short: {} bytes, expected at least {}",
            data.len(),
            VERSION_BATTERY_MIN_LEN
        )));
    }

    let mut buf = data;
    let battery_level = buf.get_u8();
    buf.advance(1);

    Ok(VersionBattery {
        battery_level,
        firmware_version: String::from_utf8_lossy(buf).into_owned(),
    })
}

/// Parse the sensor-data characteristic
///
/// Layout (little-endian):
/// - Bytes 0-1: temperature (u16, divide by 10.0 for Celsius)
/// - Byte 2: unused
/// - Bytes 3-6: brightness in lux (u32)
/// - Byte 7: moisture in percent
/// - Bytes 8-9: conductivity in µS/cm (u16)
///
/// # Errors
///
/// Returns [`MifloraError::Read`] if the payload is shorter than
/// [`SENSOR_DATA_MIN_LEN`].
pub fn parse_sensor_data(data: &[u8]) -> Result<SensorReading> {
    if data.len() < SENSOR_DATA_MIN_LEN {
        return Err(MifloraError::Read(format!(
            "Sensor data payload too short: {} bytes, expected at least {}",
            data.len(),
            SENSOR_DATA_MIN_LEN
        )));
    }

    let mut buf = data;
    let temperature = f64::from(buf.get_u16_le()) / 10.0;
    buf.advance(1);
    let brightness = buf.get_u32_le();
    let moisture = buf.get_u8();
    let conductivity = buf.get_u16_le();

    Ok(SensorReading {
        temperature,
        brightness,
        moisture,
        conductivity,
    })
}

/// Turn a firmware version such as `2.6.6` into a comparable number such as `20606`
///
/// Every dot-separated segment is worth a factor of 100 more than the one after it.
/// Segments that are not numbers contribute nothing.
#[must_use]
pub fn numeric_firmware_version(version: &str) -> u64 {
    let parts: Vec<&str> = version.split('.').collect();
    let count = parts.len();

    parts
        .iter()
        .enumerate()
        .filter_map(|(index, part)| {
            let value = part.parse::<u64>().ok()?;
            let exponent = u32::try_from(count - index - 1).unwrap_or(u32::MAX);
            Some(value.saturating_mul(100u64.saturating_pow(exponent)))
        })
        .fold(0u64, u64::saturating_add)
}

/// Check if the firmware needs [`MODE_CHANGE_COMMAND`] written before a sensor read
///
/// This is a plain string comparison, so `"10.0.0"` sorts below `"2.6.6"`.
#[must_use]
pub fn requires_mode_change_before_read(version: &str) -> bool {
    version >= MODE_CHANGE_MIN_FIRMWARE
}

/// Lower-case an address and strip everything but `a-z` and `0-9`
#[must_use]
pub fn alpha_numeric_id(address: &str) -> String {
    address
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// Payload for the mode-change characteristic
#[must_use]
pub const fn mode_change_command() -> [u8; 2] {
    MODE_CHANGE_COMMAND
}
