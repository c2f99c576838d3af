/// Beacon address mapping and latest-reading cache
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::time::Duration;

use crate::bluetooth::decoder::DecoderTable;
use crate::bluetooth::scanner::RawAdvertisement;
use crate::config::{BeaconConfig, DeviceFile};
use crate::models::{DeviceMap, DeviceRecord};

/// Company id (2 bytes) + device address (6 bytes) ahead of the payload
const MANUFACTURER_HEADER_LEN: usize = 8;
const SERVICE_TYPE_OFFSET: usize = 2;

/// Where readings of one physical beacon go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconTarget {
    pub key: String,
    pub kind: u8,
    pub name: String,
}

/// Normalized form of a BLE address as used for lookups
fn normalize(addr: &str) -> String {
    addr.trim().to_uppercase()
}

pub struct BeaconRegistry {
    conf_path: Option<PathBuf>,
    last_modified: Option<SystemTime>,
    targets: HashMap<String, BeaconTarget>,
    devices: HashMap<String, DeviceRecord>,
    decoders: DecoderTable,
    stale_after: Duration,
}

impl BeaconRegistry {
    /// Registry whose beacon list is read from the `switchbot` section of `conf_path`
    pub fn from_file(conf_path: PathBuf, decoders: DecoderTable, stale_after: Duration) -> Self {
        BeaconRegistry {
            conf_path: Some(conf_path),
            last_modified: None,
            targets: HashMap::new(),
            devices: HashMap::new(),
            decoders,
            stale_after,
        }
    }

    /// Registry with a fixed beacon list
    pub fn with_beacons(
        beacons: &[BeaconConfig],
        decoders: DecoderTable,
        stale_after: Duration,
    ) -> Self {
        let mut registry = BeaconRegistry {
            conf_path: None,
            last_modified: None,
            targets: HashMap::new(),
            devices: HashMap::new(),
            decoders,
            stale_after,
        };
        registry.apply(beacons);
        registry
    }

    /// Replace the address map; cached readings are kept
    pub fn apply(&mut self, beacons: &[BeaconConfig]) {
        self.targets = beacons
            .iter()
            .map(|b| {
                (
                    normalize(&b.addr),
                    BeaconTarget {
                        key: b.key.clone(),
                        kind: b.kind,
                        name: b.name.clone(),
                    },
                )
            })
            .collect();
        for (addr, target) in &self.targets {
            if !self.decoders.supports(target.kind) {
                warn!("No decoder for type={:#x} ({})", target.kind, addr);
            }
        }
    }

    /// Re-read the beacon list if the device file changed since the last load
    ///
    /// Returns true when a new list was applied. A file that fails to parse
    /// keeps the previous mapping.
    pub fn reload_if_changed(&mut self) -> bool {
        let Some(path) = self.conf_path.clone() else {
            return false;
        };
        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!("Device file {} not readable: {}", path.display(), e);
                return false;
            }
        };
        if self.last_modified.is_some_and(|last| modified <= last) {
            return false;
        }

        // Mark the mtime as seen even on failure, a broken file is not retried every minute
        self.last_modified = Some(modified);
        match DeviceFile::load(&path) {
            Ok(file) => {
                self.apply(&file.beacons);
                info!("Config: {} beacons from {}", self.targets.len(), path.display());
                true
            }
            Err(e) => {
                error!("Keeping previous beacon list: {:#}", e);
                false
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn target(&self, addr: &str) -> Option<&BeaconTarget> {
        self.targets.get(&normalize(addr))
    }

    /// Decode one advertisement and merge it into the owning device
    ///
    /// Returns true when the merged reading differs from the cached one,
    /// in which case the device's update time moves to `now`.
    pub fn ingest(&mut self, adv: &RawAdvertisement, now: i64) -> bool {
        let Some(target) = self.targets.get(&normalize(&adv.address)) else {
            debug!("Unknown addr {}", adv.address);
            return false;
        };

        if adv.manufacturer_data.len() < MANUFACTURER_HEADER_LEN {
            warn!("Format error {}", adv.address);
            return false;
        }

        // Service data, when long enough, must agree with the configured type
        let service = adv.service_data.as_slice();
        if service.len() > SERVICE_TYPE_OFFSET {
            if service[SERVICE_TYPE_OFFSET] != target.kind {
                error!(
                    "Device type mismatch {:#x}!={:#x} ({})",
                    service[SERVICE_TYPE_OFFSET], target.kind, adv.address
                );
                return false;
            }
        } else if !service.is_empty() {
            warn!("Service data too short {}", service.len());
        } else {
            debug!("No service data {}", adv.address);
        }

        let payload = &adv.manufacturer_data[MANUFACTURER_HEADER_LEN..];
        let Some(mut reading) = self.decoders.decode(target.kind, payload, service) else {
            debug!("Parse error {}", adv.address);
            return false;
        };
        // Display name follows the latest configuration
        reading.insert("name", target.name.as_str());

        let record = self.devices.entry(target.key.clone()).or_default();
        let merged = record.dat.merged(&reading);
        if merged == record.dat {
            debug!("Same data {}", adv.address);
            return false;
        }

        let diff = if record.ut > 0 { now - record.ut } else { -1 };
        record.dat = merged;
        record.ut = now;
        info!("{} {:?} {:+}s", target.key, reading, diff);
        true
    }

    /// Devices updated within the staleness horizon; older entries stay cached
    pub fn deliver(&self, now: i64) -> DeviceMap {
        let horizon = now - self.stale_after.as_secs() as i64;
        let mut delivered = DeviceMap::new();
        for (key, record) in &self.devices {
            if record.ut > horizon {
                delivered.insert(key.clone(), record.clone());
            } else {
                debug!("Stale {} (ut={})", key, record.ut);
            }
        }
        delivered
    }
}
