use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{pin::Pin, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MifloraError, Result};

/// Polling period while waiting for the link to report disconnected
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Case-insensitive match on a peripheral address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMatcher {
    address: String,
}

impl AddressMatcher {
    /// Create a matcher for `address`
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Address this matcher looks for
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check if an advertised address is the one we look for
    #[must_use]
    pub fn matches(&self, advertised: &str) -> bool {
        advertised.eq_ignore_ascii_case(&self.address)
    }
}

/// Advertisement that matched a scan
#[derive(Debug, Clone)]
pub struct Advertisement<D> {
    /// Address as reported by the adapter
    pub address: String,
    /// Signal strength at the moment of the match
    pub rssi: i16,
    /// Transport handle used to connect
    pub device: D,
}

/// One service of a discovered profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Service UUID
    pub uuid: Uuid,
    /// UUIDs of the characteristics of this service
    pub characteristics: Vec<Uuid>,
}

/// Services and characteristics of a connected peripheral
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceProfile {
    /// Discovered services
    pub services: Vec<ServiceEntry>,
}

impl ServiceProfile {
    /// Check if `service` exposes `characteristic`
    #[must_use]
    pub fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.services
            .iter()
            .filter(|s| s.uuid == service)
            .any(|s| s.characteristics.contains(&characteristic))
    }
}

/// Radio operations the peripheral reader needs
///
/// Every operation is a single request/response call. Apart from `scan` the
/// implementations do not bound their own duration; the reader wraps each call
/// in a timeout.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Handle of a peripheral seen while scanning
    type Device: Send + Sync;
    /// Handle of a connected peripheral
    type Client: Send + Sync;

    /// Scan until an advertisement matches or `timeout` elapses
    async fn scan(
        &self,
        matcher: &AddressMatcher,
        timeout: Duration,
    ) -> Result<Advertisement<Self::Device>>;

    /// Connect to an advertised peripheral
    async fn connect(&self, advertisement: &Advertisement<Self::Device>) -> Result<Self::Client>;

    /// Enumerate services and characteristics
    async fn discover_profile(&self, client: &Self::Client) -> Result<ServiceProfile>;

    /// Read a characteristic value
    async fn read_characteristic(
        &self,
        client: &Self::Client,
        characteristic: Uuid,
    ) -> Result<Vec<u8>>;

    /// Write a characteristic value and wait for the response
    async fn write_characteristic(
        &self,
        client: &Self::Client,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()>;

    /// Cancel the connection and wait until the transport confirms the teardown
    async fn disconnect(&self, client: Self::Client) -> Result<()>;

    /// Withdraw a connect request that was abandoned before it completed
    ///
    /// The platform may still finish the connection in the background, so
    /// this tears down whatever link the request left behind.
    async fn cancel_connect(&self, advertisement: &Advertisement<Self::Device>) -> Result<()>;

    /// Release the adapter
    async fn shutdown(&self) -> Result<()>;
}

/// [`BleTransport`] backed by the host Bluetooth stack via btleplug
pub struct BtleplugTransport {
    _manager: Manager,
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Open the Bluetooth adapter at `adapter_index`
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`MifloraError::Validation`] if there is no adapter at that index.
    pub async fn new(adapter_index: usize) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(adapter_index)
            .ok_or_else(|| {
                MifloraError::Validation(format!("Bluetooth adapter {adapter_index} not found"))
            })?;

        match adapter.adapter_info().await {
            Ok(adapter_info) => info!("Using Bluetooth adapter {}", adapter_info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            _manager: manager,
            adapter,
        })
    }

    async fn wait_for_match(
        &self,
        events: &mut Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
        matcher: &AddressMatcher,
    ) -> Option<Advertisement<Peripheral>> {
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };

            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };

            let address = peripheral.address().to_string();
            if !matcher.matches(&address) {
                continue;
            }

            let rssi = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|properties| properties.rssi)
                .unwrap_or_default();

            return Some(Advertisement {
                address,
                rssi,
                device: peripheral,
            });
        }

        None
    }
}

/// Find a characteristic on a peripheral that has already discovered its services
fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Device = Peripheral;
    type Client = Peripheral;

    async fn scan(
        &self,
        matcher: &AddressMatcher,
        timeout: Duration,
    ) -> Result<Advertisement<Peripheral>> {
        let mut events = self.adapter.events().await.map_err(|e| {
            MifloraError::Connect(format!("Failed to subscribe to scan events: {e}"))
        })?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| MifloraError::Connect(format!("Failed to start scan: {e}")))?;

        let found = tokio::time::timeout(timeout, self.wait_for_match(&mut events, matcher)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }

        match found {
            Ok(Some(advertisement)) => Ok(advertisement),
            Ok(None) => Err(MifloraError::Connect(
                "Scan event stream ended unexpectedly".to_string(),
            )),
            Err(_) => Err(MifloraError::Connect(format!(
                "{} not seen within {}ms",
                matcher.address(),
                timeout.as_millis()
            ))),
        }
    }

    async fn connect(&self, advertisement: &Advertisement<Peripheral>) -> Result<Peripheral> {
        advertisement
            .device
            .connect()
            .await
            .map_err(|e| MifloraError::Connect(e.to_string()))?;

        Ok(advertisement.device.clone())
    }

    async fn discover_profile(&self, client: &Peripheral) -> Result<ServiceProfile> {
        client
            .discover_services()
            .await
            .map_err(|e| MifloraError::Profile(e.to_string()))?;

        let services = client
            .services()
            .into_iter()
            .map(|service| ServiceEntry {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect();

        Ok(ServiceProfile { services })
    }

    async fn read_characteristic(
        &self,
        client: &Peripheral,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let characteristic = find_characteristic(client, characteristic).ok_or_else(|| {
            MifloraError::Read(format!("Characteristic {characteristic} not found"))
        })?;

        let data = client
            .read(&characteristic)
            .await
            .map_err(|e| MifloraError::Read(e.to_string()))?;
        debug!("Read {}: {:02X?}", characteristic.uuid, data);

        Ok(data)
    }

    async fn write_characteristic(
        &self,
        client: &Peripheral,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let characteristic = find_characteristic(client, characteristic).ok_or_else(|| {
            MifloraError::Write(format!("Characteristic {characteristic} not found"))
        })?;

        debug!("Writing {}: {:02X?}", characteristic.uuid, data);
        client
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| MifloraError::Write(e.to_string()))
    }

    async fn disconnect(&self, client: Peripheral) -> Result<()> {
        client.disconnect().await?;

        while client.is_connected().await? {
            tokio::time::sleep(DISCONNECT_POLL_INTERVAL).await;
        }

        Ok(())
    }

    async fn cancel_connect(&self, advertisement: &Advertisement<Peripheral>) -> Result<()> {
        debug!("Withdrawing connect request to {}", advertisement.address);
        advertisement.device.disconnect().await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Releasing Bluetooth adapter");
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan on shutdown: {}", e);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MIFLORA_SENSOR_DATA_CHAR_UUID, MIFLORA_SERVICE_UUID};

    #[test]
    fn test_address_matcher_ignores_case() {
        let matcher = AddressMatcher::new("c4:7c:8d:6a:12:34");
        assert!(matcher.matches("C4:7C:8D:6A:12:34"));
        assert!(matcher.matches("c4:7c:8d:6a:12:34"));
        assert!(!matcher.matches("C4:7C:8D:6A:12:35"));
        assert_eq!(matcher.address(), "c4:7c:8d:6a:12:34");
    }

    #[test]
    fn test_service_profile_lookup() {
        let profile = mock::miflora_profile();
        assert!(profile.has_characteristic(MIFLORA_SERVICE_UUID, MIFLORA_SENSOR_DATA_CHAR_UUID));
        assert!(!profile.has_characteristic(Uuid::nil(), MIFLORA_SENSOR_DATA_CHAR_UUID));
        assert!(!ServiceProfile::default()
            .has_characteristic(MIFLORA_SERVICE_UUID, MIFLORA_SENSOR_DATA_CHAR_UUID));
    }
}
