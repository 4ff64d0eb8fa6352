use crate::{
    ble::{AddressMatcher, Advertisement, BleTransport, ServiceProfile},
    error::{MifloraError, Result},
    protocol::{
        mode_change_command, parse_sensor_data, parse_version_battery,
        requires_mode_change_before_read,
    },
    types::{DataMetric, Peripheral, SensorReading, VersionBattery},
    MIFLORA_MODE_CHANGE_CHAR_UUID, MIFLORA_SENSOR_DATA_CHAR_UUID, MIFLORA_SERVICE_UUID,
    MIFLORA_VERSION_BATTERY_CHAR_UUID,
};
use std::{
    fmt,
    future::Future,
    time::{Duration, SystemTime},
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Step of a single readout
///
/// A readout walks these steps in order and never goes back. Metadata refresh
/// and mode change are skipped when not needed. Disconnect follows whatever
/// step the readout stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStage {
    /// Scanning for the advertisement and connecting
    Connect,
    /// Enumerating services and characteristics
    DiscoverProfile,
    /// Reading the version-battery characteristic
    RefreshMetadata,
    /// Writing the mode-change command
    ChangeMode,
    /// Reading the sensor-data characteristic
    ReadSensor,
}

impl ReadStage {
    /// Turn any error raised during this step into the error kind of the step
    #[must_use]
    pub fn wrap(self, error: MifloraError) -> MifloraError {
        let reason = match error {
            MifloraError::Connect(reason)
            | MifloraError::Profile(reason)
            | MifloraError::Read(reason)
            | MifloraError::Write(reason) => reason,
            other => other.to_string(),
        };
        let message = format!("{self}: {reason}");

        match self {
            Self::Connect => MifloraError::Connect(message),
            Self::DiscoverProfile => MifloraError::Profile(message),
            Self::RefreshMetadata | Self::ReadSensor => MifloraError::Read(message),
            Self::ChangeMode => MifloraError::Write(message),
        }
    }
}

impl fmt::Display for ReadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "can't connect"),
            Self::DiscoverProfile => write!(f, "can't discover profile"),
            Self::RefreshMetadata => write!(f, "can't request version battery"),
            Self::ChangeMode => write!(f, "can't request mode change"),
            Self::ReadSensor => write!(f, "can't request sensor data"),
        }
    }
}

/// Divisor of the scan timeout kept back for disconnecting
const TEARDOWN_SHARE: u32 = 5;

/// Established link to a peripheral
#[derive(Debug)]
pub struct Connection<C> {
    /// Transport handle of the connected peripheral
    pub client: C,
    /// Signal strength seen in the matching advertisement
    pub rssi: i16,
    /// Seconds from scan start until the link was up
    pub connect_seconds: f64,
}

/// Drives one peripheral through a complete readout
///
/// One readout, disconnect included, finishes within the scan timeout. Every
/// step runs against a single deadline, and the link is torn down on every
/// exit path once a connection was made.
pub struct PeripheralReader<'a, T: BleTransport> {
    transport: &'a T,
    scan_timeout: Duration,
}

impl<'a, T: BleTransport> PeripheralReader<'a, T> {
    /// Create a reader that bounds every readout by `scan_timeout`
    #[must_use]
    pub const fn new(transport: &'a T, scan_timeout: Duration) -> Self {
        Self {
            transport,
            scan_timeout,
        }
    }

    /// Part of the budget held back for tearing the link down
    #[must_use]
    pub fn teardown_reserve(&self) -> Duration {
        self.scan_timeout / TEARDOWN_SHARE
    }

    /// Read one peripheral from scan to disconnect
    ///
    /// Scan, connect and the GATT steps share the scan timeout minus the
    /// [teardown reserve](Self::teardown_reserve); the disconnect gets what is
    /// left of the scan timeout. On success the peripheral's cached metadata
    /// may have been refreshed.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step, wrapped by [`ReadStage::wrap`].
    pub async fn read(&self, peripheral: &mut Peripheral) -> Result<DataMetric> {
        let deadline = Instant::now() + self.scan_timeout;
        let steps_deadline = deadline - self.teardown_reserve();

        let connection = self.connect(peripheral, steps_deadline).await?;

        let outcome = self
            .read_connected(&connection.client, peripheral, steps_deadline)
            .await;

        if let Err(e) = self.disconnect(connection.client, deadline).await {
            warn!("Disconnect from {} not confirmed: {}", peripheral.id, e);
        }

        let (sensor, readout_seconds) = outcome?;
        info!(
            "Read {}: {:.1}°C, {} lux, {}% moisture, {} µS/cm",
            peripheral.id,
            sensor.temperature,
            sensor.brightness,
            sensor.moisture,
            sensor.conductivity
        );

        Ok(DataMetric {
            peripheral_id: peripheral.id.clone(),
            metadata: peripheral.cached_metadata.clone(),
            sensor,
            connect_seconds: connection.connect_seconds,
            readout_seconds,
            rssi: connection.rssi,
        })
    }

    async fn read_connected(
        &self,
        client: &T::Client,
        peripheral: &mut Peripheral,
        deadline: Instant,
    ) -> Result<(SensorReading, f64)> {
        let readout_start = Instant::now();

        self.discover_profile(client, deadline).await?;
        self.refresh_metadata_if_stale(client, peripheral, SystemTime::now(), deadline)
            .await?;
        self.conditionally_change_mode(client, &peripheral.cached_metadata, deadline)
            .await?;
        let sensor = self.read_sensor_data(client, deadline).await?;

        Ok((sensor, readout_start.elapsed().as_secs_f64()))
    }

    /// Scan for the peripheral's advertisement and connect to it before `deadline`
    ///
    /// A connect request still pending at the deadline is withdrawn through
    /// [`BleTransport::cancel_connect`], bounded by the teardown reserve.
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Connect`] on timeout or transport failure.
    pub async fn connect(
        &self,
        peripheral: &Peripheral,
        deadline: Instant,
    ) -> Result<Connection<T::Client>> {
        info!("Scanning for {}...", peripheral.id);
        let matcher = AddressMatcher::new(peripheral.id.as_str());
        let connect_start = Instant::now();

        let scan_window = deadline.saturating_duration_since(connect_start);
        let advertisement = self
            .bounded(
                ReadStage::Connect,
                deadline,
                self.transport.scan(&matcher, scan_window),
            )
            .await?;
        debug!(
            "Found {} with RSSI {}",
            advertisement.address, advertisement.rssi
        );

        let client = match timeout_at(deadline, self.transport.connect(&advertisement)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return Err(ReadStage::Connect.wrap(e)),
            Err(_) => {
                self.cancel_connect(&advertisement).await;
                return Err(ReadStage::Connect.wrap(self.timeout_error()));
            }
        };

        let connect_seconds = connect_start.elapsed().as_secs_f64();
        debug!("Connected to {} in {:.2}s", peripheral.id, connect_seconds);

        Ok(Connection {
            client,
            rssi: advertisement.rssi,
            connect_seconds,
        })
    }

    async fn cancel_connect(&self, advertisement: &Advertisement<T::Device>) {
        let cancelled = tokio::time::timeout(
            self.teardown_reserve(),
            self.transport.cancel_connect(advertisement),
        )
        .await;

        match cancelled {
            Ok(Ok(())) => debug!("Withdrew connect request to {}", advertisement.address),
            Ok(Err(e)) => warn!(
                "Can't withdraw connect request to {}: {}",
                advertisement.address, e
            ),
            Err(_) => warn!(
                "Withdrawing connect request to {} not confirmed",
                advertisement.address
            ),
        }
    }

    /// Enumerate the profile and check that the Mi Flora characteristics are present
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Profile`] if discovery fails, a characteristic is
    /// missing or `deadline` passes.
    pub async fn discover_profile(
        &self,
        client: &T::Client,
        deadline: Instant,
    ) -> Result<ServiceProfile> {
        let profile = self
            .bounded(
                ReadStage::DiscoverProfile,
                deadline,
                self.transport.discover_profile(client),
            )
            .await?;

        let missing: Vec<String> = [
            MIFLORA_MODE_CHANGE_CHAR_UUID,
            MIFLORA_SENSOR_DATA_CHAR_UUID,
            MIFLORA_VERSION_BATTERY_CHAR_UUID,
        ]
        .into_iter()
        .filter(|characteristic| {
            !profile.has_characteristic(MIFLORA_SERVICE_UUID, *characteristic)
        })
        .map(|characteristic| characteristic.to_string())
        .collect();

        if !missing.is_empty() {
            return Err(ReadStage::DiscoverProfile.wrap(MifloraError::Profile(format!(
                "Mi Flora service {} lacks characteristics {}",
                MIFLORA_SERVICE_UUID,
                missing.join(", ")
            ))));
        }

        Ok(profile)
    }

    /// Read battery level and firmware version if the cached copy is 24 hours old or older
    ///
    /// Returns whether the metadata was read. The peripheral is only touched on success.
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Read`] if reading or decoding fails.
    pub async fn refresh_metadata_if_stale(
        &self,
        client: &T::Client,
        peripheral: &mut Peripheral,
        now: SystemTime,
        deadline: Instant,
    ) -> Result<bool> {
        if !peripheral.metadata_is_stale(now) {
            debug!("Using cached metadata for {}", peripheral.id);
            return Ok(false);
        }

        let metadata = self
            .bounded(ReadStage::RefreshMetadata, deadline, async {
                let data = self
                    .transport
                    .read_characteristic(client, MIFLORA_VERSION_BATTERY_CHAR_UUID)
                    .await?;
                parse_version_battery(&data)
            })
            .await?;

        info!(
            "{}: firmware {}, battery {}%",
            peripheral.id, metadata.firmware_version, metadata.battery_level
        );
        peripheral.update_metadata(metadata, now);

        Ok(true)
    }

    /// Write the mode-change command if the firmware needs it
    ///
    /// Returns whether the command was written.
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Write`] if the write fails.
    pub async fn conditionally_change_mode(
        &self,
        client: &T::Client,
        metadata: &VersionBattery,
        deadline: Instant,
    ) -> Result<bool> {
        if !requires_mode_change_before_read(&metadata.firmware_version) {
            return Ok(false);
        }

        self.bounded(
            ReadStage::ChangeMode,
            deadline,
            self.transport.write_characteristic(
                client,
                MIFLORA_MODE_CHANGE_CHAR_UUID,
                &mode_change_command(),
            ),
        )
        .await?;

        Ok(true)
    }

    /// Read and decode the sensor-data characteristic
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Read`] if reading or decoding fails.
    pub async fn read_sensor_data(
        &self,
        client: &T::Client,
        deadline: Instant,
    ) -> Result<SensorReading> {
        self.bounded(ReadStage::ReadSensor, deadline, async {
            let data = self
                .transport
                .read_characteristic(client, MIFLORA_SENSOR_DATA_CHAR_UUID)
                .await?;
            parse_sensor_data(&data)
        })
        .await
    }

    /// Tear the link down and wait for the transport to confirm until `deadline`
    ///
    /// A peripheral that already dropped the link cannot stall the sweep.
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Timeout`] if the teardown is not confirmed in time,
    /// or the transport's error.
    pub async fn disconnect(&self, client: T::Client, deadline: Instant) -> Result<()> {
        timeout_at(deadline, self.transport.disconnect(client))
            .await
            .map_err(|_| self.timeout_error())?
    }

    async fn bounded<R>(
        &self,
        stage: ReadStage,
        deadline: Instant,
        operation: impl Future<Output = Result<R>> + Send,
    ) -> Result<R> {
        match timeout_at(deadline, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(stage.wrap(e)),
            Err(_) => Err(stage.wrap(self.timeout_error())),
        }
    }

    fn timeout_error(&self) -> MifloraError {
        MifloraError::Timeout {
            timeout_ms: duration_ms(self.scan_timeout),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
