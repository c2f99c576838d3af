/// Bluetooth Low Energy scanning for SwitchBot advertisements
use async_trait::async_trait;
use bluer::{AdapterEvent, Address, Uuid};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::time::{sleep, Duration};

// SwitchBot protocol constants
const SWITCHBOT_MANUFACTURER_ID: u16 = 0x0969; // Woan Technology manufacturer ID
const SWITCHBOT_SERVICE_UUID16: u16 = 0xfd3d;
const SWITCHBOT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fd3d_0000_1000_8000_00805f9b34fb);

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("adapter {0} is powered off")]
    PoweredOff(String),
}

/// One received advertisement in raw AD-structure framing
///
/// `manufacturer_data` starts with the 2-byte company id followed by the
/// 6-byte device address; `service_data` starts with the 16-bit service
/// UUID, so byte 2 is the SwitchBot device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub address: String,
    pub manufacturer_data: Vec<u8>,
    pub service_data: Vec<u8>,
}

/// Source of advertisements for a time-boxed scan
#[async_trait]
pub trait AdvertisementScanner: Send {
    /// Start a scan lasting at most `window`; the returned stream ends when the window closes.
    async fn scan(
        &mut self,
        window: Duration,
    ) -> Result<BoxStream<'static, RawAdvertisement>, ScanError>;
}

/// BlueZ backed scanner, the adapter is opened on first use and kept afterwards
#[derive(Default)]
pub struct BluezScanner {
    adapter: Option<bluer::Adapter>,
    // Keeps the D-Bus connection alive for the adapter
    session: Option<bluer::Session>,
}

impl BluezScanner {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&mut self) -> Result<bluer::Adapter, ScanError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        // Initialize Bluetooth session and the default adapter
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        if !adapter.is_powered().await? {
            return Err(ScanError::PoweredOff(adapter.name().to_string()));
        }

        // Low Energy only, report every advertisement so field updates are not lost
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        info!("Using Bluetooth adapter {}", adapter.name());
        self.session = Some(session);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }
}

#[async_trait]
impl AdvertisementScanner for BluezScanner {
    async fn scan(
        &mut self,
        window: Duration,
    ) -> Result<BoxStream<'static, RawAdvertisement>, ScanError> {
        let adapter = match self.adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                // Drop a half-initialised adapter so the next cycle starts over
                self.adapter = None;
                self.session = None;
                return Err(e);
            }
        };

        let events = adapter.discover_devices_with_changes().await?;
        let stream = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    match event {
                        AdapterEvent::DeviceAdded(addr) => read_advertisement(&adapter, addr).await,
                        _ => None,
                    }
                }
            })
            .take_until(sleep(window))
            .boxed();
        Ok(stream)
    }
}

/// Read the current advertisement properties of one device
async fn read_advertisement(adapter: &bluer::Adapter, addr: Address) -> Option<RawAdvertisement> {
    let device = adapter.device(addr).ok()?;
    let address = addr.to_string().to_uppercase();

    let manufacturer = match device.manufacturer_data().await {
        Ok(Some(data)) => data.get(&SWITCHBOT_MANUFACTURER_ID).cloned(),
        Ok(None) => None,
        Err(e) => {
            debug!("Failed to get manufacturer data for {}: {}", address, e);
            None
        }
    };
    let service = match device.service_data().await {
        Ok(Some(data)) => data.get(&SWITCHBOT_SERVICE_UUID).cloned(),
        _ => None,
    };

    // Nothing from SwitchBot on this device
    if manufacturer.is_none() && service.is_none() {
        return None;
    }

    Some(RawAdvertisement {
        address,
        manufacturer_data: manufacturer
            .map(|payload| frame(SWITCHBOT_MANUFACTURER_ID, &payload))
            .unwrap_or_default(),
        service_data: service
            .map(|payload| frame(SWITCHBOT_SERVICE_UUID16, &payload))
            .unwrap_or_default(),
    })
}

/// Prefix a payload with its little-endian 16-bit identifier
fn frame(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut framed = id.to_le_bytes().to_vec();
    framed.extend_from_slice(payload);
    framed
}
