/// Once-a-minute collection cycle
///
/// Each cycle scans BLE until the next minute boundary, then polls the
/// appliances over Wi-Fi. The two never overlap because they interfere on
/// the same radio hardware.
use futures_util::StreamExt;
use log::{error, info, warn};
use std::sync::Arc;
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::appliance::{ApplianceScraper, PageFetcher};
use crate::bluetooth::{AdvertisementScanner, BeaconRegistry};
use crate::config::RotationSchedule;
use crate::models::{DeviceMap, Snapshot};
use crate::storage::{StorageError, TelemetryLog};
use crate::utils::{format_datetime, local_now, unix_now, until_next_minute};

pub struct Collector<S, F> {
    registry: BeaconRegistry,
    scanner: S,
    scraper: ApplianceScraper<F>,
    log: TelemetryLog,
    rotate_at: RotationSchedule,
    offset: UtcOffset,
    last_rotation: Option<Date>,
}

impl<S, F> Collector<S, F>
where
    S: AdvertisementScanner,
    F: PageFetcher,
{
    pub fn new(
        registry: BeaconRegistry,
        scanner: S,
        scraper: ApplianceScraper<F>,
        log: TelemetryLog,
        rotate_at: RotationSchedule,
        offset: UtcOffset,
    ) -> Self {
        Collector {
            registry,
            scanner,
            scraper,
            log,
            rotate_at,
            offset,
            last_rotation: None,
        }
    }

    /// Run cycles forever; only a storage failure ends the loop
    pub async fn run(mut self) -> Result<(), StorageError> {
        info!("Starting collection service");
        loop {
            let now = local_now(self.offset);
            let window = until_next_minute(&now);
            self.run_cycle(window).await?;
        }
    }

    /// One full cycle: scan for `scan_window`, poll, append, maybe rotate
    pub async fn run_cycle(&mut self, scan_window: Duration) -> Result<Arc<Snapshot>, StorageError> {
        let beacons = self.scan(scan_window).await;
        let appliances = self.scraper.poll(unix_now()).await;

        // Appliance keys win on the (unexpected) collision
        let mut devices = beacons;
        devices.extend(appliances);

        let snapshot = self.log.append(Snapshot::new(unix_now(), devices)).await?;
        info!(
            "Snapshot {} with {} devices",
            snapshot.timestamp,
            snapshot.devices.len()
        );

        self.rotate_if_due(local_now(self.offset)).await?;
        Ok(snapshot)
    }

    /// Scan BLE for at most `window` and return the fresh beacon readings
    async fn scan(&mut self, window: Duration) -> DeviceMap {
        if window.is_zero() {
            return DeviceMap::new();
        }
        let deadline = Instant::now() + window;

        self.registry.reload_if_changed();
        if self.registry.is_empty() {
            sleep(window).await;
            return DeviceMap::new();
        }

        let mut events = match self.scanner.scan(window).await {
            Ok(events) => events,
            Err(e) => {
                error!("Scan failed: {}", e);
                sleep_until(deadline).await;
                return DeviceMap::new();
            }
        };

        let mut updates = 0;
        while let Some(advertisement) = events.next().await {
            if self.registry.ingest(&advertisement, unix_now()) {
                updates += 1;
            }
        }
        drop(events);
        // Keep Wi-Fi traffic out of the scan window even if the stream ended early
        sleep_until(deadline).await;

        info!("Scan complete: {} updates", updates);
        self.registry.deliver(unix_now())
    }

    async fn rotate_if_due(&mut self, now: OffsetDateTime) -> Result<(), StorageError> {
        if !rotation_due(self.rotate_at, &now, self.last_rotation) {
            return Ok(());
        }
        info!("Daily rotation at {}", format_datetime(&now));
        match self.log.rotate(now.date()).await? {
            Some(path) => info!("Archive written: {}", path.display()),
            None => warn!("Journal empty, no archive written"),
        }
        self.last_rotation = Some(now.date());
        Ok(())
    }
}

/// Rotation happens in the scheduled minute, once per calendar date
pub fn rotation_due(schedule: RotationSchedule, now: &OffsetDateTime, last: Option<Date>) -> bool {
    now.hour() == schedule.hour && now.minute() == schedule.minute && last != Some(now.date())
}
