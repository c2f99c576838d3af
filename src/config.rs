use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::time::Duration;

/// Energy appliance connection record (`aiseg2` list of the device file)
#[derive(Debug, Clone, Deserialize)]
pub struct ApplianceConfig {
    pub key: String,
    pub addr: String,
    /// Digest credentials as `[user, password]`
    pub sec: (String, String),
    #[serde(default)]
    pub difcalc: bool,
    #[serde(default)]
    pub difname: String,
}

/// BLE beacon record (`switchbot` list of the device file)
#[derive(Debug, Clone, Deserialize)]
pub struct BeaconConfig {
    pub addr: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub name: String,
}

/// Device definition file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceFile {
    #[serde(default, rename = "aiseg2")]
    pub appliances: Vec<ApplianceConfig>,
    #[serde(default, rename = "switchbot")]
    pub beacons: Vec<BeaconConfig>,
}

impl DeviceFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse device file {}", path.display()))
    }
}

/// Local time-of-day at which the journal is archived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSchedule {
    pub hour: u8,
    pub minute: u8,
}

impl Default for RotationSchedule {
    fn default() -> Self {
        RotationSchedule {
            hour: 23,
            minute: 59,
        }
    }
}

impl FromStr for RotationSchedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("expected HH:MM, got '{}'", s))?;
        let hour: u8 = hour.parse().with_context(|| format!("bad hour in '{}'", s))?;
        let minute: u8 = minute
            .parse()
            .with_context(|| format!("bad minute in '{}'", s))?;
        if hour > 23 || minute > 59 {
            return Err(anyhow!("time of day out of range: '{}'", s));
        }
        Ok(RotationSchedule { hour, minute })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub device_conf: PathBuf,
    pub record_file: PathBuf,
    pub archive_dir: PathBuf,
    pub error_file: PathBuf,
    pub http_bind: String,
    pub web_root: Option<PathBuf>,
    /// Retries after the first attempt of every appliance request
    pub get_retry: usize,
    pub http_timeout: Duration,
    pub stale_after: Duration,
    pub rotate_at: RotationSchedule,
    pub max_snapshots: usize,
    pub appliances: Vec<ApplianceConfig>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} has invalid value '{}': {}", key, value, e)),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    pub fn new() -> anyhow::Result<Self> {
        // Load environment variables
        dotenv::dotenv().ok();

        let device_conf = PathBuf::from(var_or("DEVICE_CONF", "device.json"));

        // Appliances are fixed for the process lifetime, beacons are re-read by the registry
        let appliances = if device_conf.exists() {
            DeviceFile::load(&device_conf)?.appliances
        } else {
            Vec::new()
        };

        let config = AppConfig {
            record_file: PathBuf::from(var_or("RECORD_FILE", "record.txt")),
            archive_dir: PathBuf::from(var_or("ARCHIVE_DIR", "archive")),
            error_file: PathBuf::from(var_or("ERROR_FILE", "aisegerr.txt")),
            http_bind: var_or("HTTP_BIND", "0.0.0.0:8080"),
            web_root: env::var("WEB_ROOT").ok().map(PathBuf::from),
            get_retry: parse_var("GET_RETRY", 2)?,
            http_timeout: Duration::from_secs(parse_var("HTTP_TIMEOUT_SECS", 10)?),
            stale_after: Duration::from_secs(parse_var("STALE_SECS", 3600)?),
            rotate_at: parse_var("ROTATE_AT", RotationSchedule::default())?,
            max_snapshots: parse_var("MAX_SNAPSHOTS", 60 * 24)?,
            device_conf,
            appliances,
        };

        if config.max_snapshots == 0 {
            return Err(anyhow!("MAX_SNAPSHOTS must be at least 1"));
        }

        Ok(config)
    }
}
