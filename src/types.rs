use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Maximum age of cached version/battery metadata before it is read again
pub const METADATA_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Battery level and firmware version as reported by the version-battery characteristic
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionBattery {
    /// Battery level in percent (0-100)
    pub battery_level: u8,
    /// Firmware version as "x.y.z"
    pub firmware_version: String,
}

/// Decoded reading of the sensor-data characteristic
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorReading {
    /// Temperature in degrees Celsius, one decimal
    pub temperature: f64,
    /// Brightness in lux
    pub brightness: u32,
    /// Soil moisture in percent (0-100)
    pub moisture: u8,
    /// Soil conductivity in µS/cm
    pub conductivity: u16,
}

/// A configured sensor and the metadata cached for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    /// Peripheral address as configured, e.g. `C4:7C:8D:6A:12:34`
    pub id: String,
    /// When metadata was last fetched successfully
    pub last_metadata_fetch: SystemTime,
    /// Metadata from the last successful fetch
    pub cached_metadata: VersionBattery,
}

impl Peripheral {
    /// Create a peripheral whose metadata will be fetched on the first read
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_metadata_fetch: UNIX_EPOCH,
            cached_metadata: VersionBattery::default(),
        }
    }

    /// Check if the cached metadata must be read again at `now`
    ///
    /// A fetch timestamp later than `now` is treated as stale.
    #[must_use]
    pub fn metadata_is_stale(&self, now: SystemTime) -> bool {
        now.duration_since(self.last_metadata_fetch)
            .map_or(true, |age| age >= METADATA_MAX_AGE)
    }

    pub(crate) fn update_metadata(&mut self, metadata: VersionBattery, fetched_at: SystemTime) {
        self.cached_metadata = metadata;
        self.last_metadata_fetch = fetched_at;
    }
}

/// Successful readout of one peripheral
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMetric {
    /// Address of the peripheral the data was read from
    pub peripheral_id: String,
    /// Metadata in effect for this readout
    pub metadata: VersionBattery,
    /// Decoded sensor values
    pub sensor: SensorReading,
    /// Seconds spent scanning and connecting
    pub connect_seconds: f64,
    /// Seconds spent from profile discovery until the sensor data was decoded
    pub readout_seconds: f64,
    /// Signal strength observed in the matching advertisement
    pub rssi: i16,
}

/// Residual failure of one peripheral after all attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMetric {
    /// Address of the peripheral that failed
    pub peripheral_id: String,
    /// Number of failures this metric reports
    pub failed: u64,
}

/// One metric produced by a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Metric {
    /// Decoded sensor data
    Data(DataMetric),
    /// Failure counter
    Error(ErrorMetric),
}

impl Metric {
    /// Address of the peripheral this metric belongs to
    #[must_use]
    pub fn peripheral_id(&self) -> &str {
        match self {
            Self::Data(metric) => &metric.peripheral_id,
            Self::Error(metric) => &metric.peripheral_id,
        }
    }
}

/// Wire format of published metric lines
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum PublishFormat {
    /// `<prefix>.miflora.<id>.<field> <value> <unix seconds>`, one line per field
    #[default]
    Graphite,
    /// `miflora,id=<id> <field>=<value>,... <unix nanoseconds>`, one line per metric
    Influx,
}

impl fmt::Display for PublishFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graphite => write!(f, "graphite"),
            Self::Influx => write!(f, "influx"),
        }
    }
}

/// Timing parameters of the sweep loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepParams {
    /// Upper bound of every radio operation in milliseconds
    pub scan_timeout_ms: u64,
    /// Period between sweeps in milliseconds
    pub interval_ms: u64,
    /// Attempts per peripheral and sweep
    pub max_attempts: u32,
}

impl SweepParams {
    /// Upper bound of every radio operation
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Period between sweeps
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Longest time a single peripheral can keep the sweep busy
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.scan_timeout().saturating_mul(self.max_attempts)
    }

    /// Longest time a sweep over `peripheral_count` peripherals can take
    #[must_use]
    pub fn worst_case_sweep(&self, peripheral_count: usize) -> Duration {
        let count = u32::try_from(peripheral_count).unwrap_or(u32::MAX);
        self.grace_period().saturating_mul(count)
    }
}

impl Default for SweepParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            interval_ms: 25_000,
            max_attempts: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peripheral_metadata_is_stale() {
        let peripheral = Peripheral::new("C4:7C:8D:6A:12:34");
        assert_eq!(peripheral.last_metadata_fetch, UNIX_EPOCH);
        assert!(peripheral.metadata_is_stale(SystemTime::now()));
    }

    #[test]
    fn test_metadata_staleness_boundary() {
        let fetched_at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut peripheral = Peripheral::new("aa:bb");
        peripheral.update_metadata(
            VersionBattery {
                battery_level: 99,
                firmware_version: "3.1.9".to_string(),
            },
            fetched_at,
        );

        assert!(!peripheral.metadata_is_stale(fetched_at));
        let almost_stale = fetched_at + METADATA_MAX_AGE - Duration::from_secs(1);
        assert!(!peripheral.metadata_is_stale(almost_stale));
        assert!(peripheral.metadata_is_stale(fetched_at + METADATA_MAX_AGE));
        assert!(peripheral.metadata_is_stale(fetched_at - Duration::from_secs(60)));
    }

    #[test]
    fn test_metric_peripheral_id() {
        let metric = Metric::Error(ErrorMetric {
            peripheral_id: "aa:bb".to_string(),
            failed: 1,
        });
        assert_eq!(metric.peripheral_id(), "aa:bb");
    }

    #[test]
    fn test_sweep_params_defaults() {
        let params = SweepParams::default();

        assert_eq!(params.scan_timeout(), Duration::from_secs(10));
        assert_eq!(params.interval(), Duration::from_secs(25));
        assert_eq!(params.max_attempts, 2);
        assert_eq!(params.grace_period(), Duration::from_secs(20));
        assert_eq!(params.worst_case_sweep(3), Duration::from_secs(60));
    }

    #[test]
    fn test_publish_format_display() {
        assert_eq!(PublishFormat::Graphite.to_string(), "graphite");
        assert_eq!(PublishFormat::Influx.to_string(), "influx");
        assert_eq!(PublishFormat::default(), PublishFormat::Graphite);
    }
}
