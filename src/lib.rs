#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # miflorad 🌱
//!
//! Polls Xiaomi Mi Flora plant sensors over Bluetooth Low Energy and republishes
//! their readings as Graphite or Influx line protocol to an MQTT broker.
//!
//! The sensors are battery powered and only reachable over a slow, unreliable
//! radio link, so the daemon is built around a strictly sequential sweep:
//!
//! - **Sweep Scheduler**: visits every configured sensor once per interval
//! - **Retry Controller**: gives each sensor a bounded number of attempts per sweep
//! - **Peripheral Reader**: scan, connect, discover, refresh metadata, change mode, read, disconnect
//! - **Protocol Codec**: decodes the version/battery and sensor payloads
//! - **Metric Pipeline**: formats readings and failures and hands them to the broker
//!
//! The stages run as separate tokio tasks connected by small bounded channels,
//! so a slow broker never stalls the radio and vice versa.
//!
//! ## Quick Start
//!
//! ```no_run
//! use miflorad::{
//!     ble::BtleplugTransport, scheduler::SweepScheduler, Peripheral, SweepParams,
//! };
//! use tokio::sync::{mpsc, watch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BtleplugTransport::new(0).await?;
//!     let (metric_tx, mut metric_rx) = mpsc::channel(1);
//!     let (_cancel_tx, cancel_rx) = watch::channel(false);
//!
//!     let mut scheduler = SweepScheduler::new(
//!         transport,
//!         vec![Peripheral::new("C4:7C:8D:6A:12:34")],
//!         SweepParams::default(),
//!         metric_tx,
//!         cancel_rx,
//!     )?;
//!
//!     tokio::spawn(async move {
//!         while let Some(metric) = metric_rx.recv().await {
//!             println!("{metric:?}");
//!         }
//!     });
//!
//!     scheduler.sweep().await;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport façade
pub mod ble;
/// Command-line configuration and start-up validation
pub mod config;
/// Reading a single sensor
pub mod device;
/// Error types and handling
pub mod error;
/// Graphite and Influx line formatting
pub mod metrics;
/// Sensor payload decoding
pub mod protocol;
/// Handing formatted lines to the broker
pub mod publish;
/// Per-sensor retry policy
pub mod retry;
/// Periodic sweep over all sensors
pub mod scheduler;
/// Type definitions and data structures
pub mod types;

pub use error::{MifloraError, Result};
pub use types::{
    DataMetric, ErrorMetric, Metric, Peripheral, PublishFormat, SensorReading, SweepParams,
    VersionBattery,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mi Flora data service UUID
pub const MIFLORA_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1204_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic that switches newer firmware into live data mode
pub const MIFLORA_MODE_CHANGE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_1a00_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic holding the current sensor values
pub const MIFLORA_SENSOR_DATA_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_1a01_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic holding battery level and firmware version
pub const MIFLORA_VERSION_BATTERY_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_1a02_0000_1000_8000_0080_5f9b_34fb);
