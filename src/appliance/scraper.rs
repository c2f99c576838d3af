/// Energy appliance polling: generation, per-circuit consumption and climate
use log::{error, info, warn};
use std::path::PathBuf;
use tokio::time::Duration;

use crate::appliance::fetcher::{FetchError, PageFetcher};
use crate::appliance::pages::{self, PageError};
use crate::config::ApplianceConfig;
use crate::models::{DeviceMap, DeviceRecord, Entry, Reading};
use crate::utils::with_retry;

const GENERATION_PAGE: &str = "page/electricflow/111";
const ENVIRONMENT_PAGE: &str = "page/airenvironment/43";
const MAX_USAGE_PAGES: usize = 32;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Consumption detail page for a 1-based rank index
fn usage_page(rank: usize) -> String {
    format!("page/electricflow/1113?id={}&request_by_form=1", rank)
}

/// Key under which climate reading `index` is published; "zz" sorts them last
fn climate_key(index: usize) -> String {
    format!("zzAS{}", index)
}

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("transport error on {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: FetchError,
    },
    #[error("unexpected page format on {path}: {source}")]
    Format {
        path: String,
        #[source]
        source: PageError,
    },
}

/// Watts missing from the itemized sum compared to the aggregate total
///
/// The aggregate is shown in kW with limited precision, so only a positive
/// shortfall is reported.
pub fn unaccounted_watts(total_kw: f64, itemized: i64) -> Option<i64> {
    let total = (total_kw * 1000.0).round() as i64;
    (itemized < total).then(|| total - itemized)
}

pub struct ApplianceScraper<F> {
    fetcher: F,
    appliances: Vec<ApplianceConfig>,
    attempts: usize,
    retry_delay: Duration,
    error_file: PathBuf,
}

impl<F: PageFetcher> ApplianceScraper<F> {
    /// # Arguments
    /// * `fetcher` - Page transport
    /// * `appliances` - Appliances polled every cycle, in order
    /// * `retries` - Extra attempts after a failed request
    /// * `error_file` - Where the latest malformed page is kept for inspection
    pub fn new(
        fetcher: F,
        appliances: Vec<ApplianceConfig>,
        retries: usize,
        error_file: PathBuf,
    ) -> Self {
        ApplianceScraper {
            fetcher,
            appliances,
            attempts: retries + 1,
            retry_delay: RETRY_DELAY,
            error_file,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.appliances.is_empty()
    }

    /// Poll every appliance once; failures only drop that appliance's data
    pub async fn poll(&self, now: i64) -> DeviceMap {
        let mut devices = DeviceMap::new();
        for appliance in &self.appliances {
            match self.read_power(appliance).await {
                Ok(reading) => {
                    info!("{} {:?}", appliance.key, reading);
                    devices.insert(
                        appliance.key.clone(),
                        DeviceRecord {
                            dat: reading,
                            ut: now,
                        },
                    );
                }
                Err(e) => {
                    error!("{}: no power data this cycle: {}", appliance.key, e);
                    continue;
                }
            }

            match self.read_climate(appliance).await {
                Ok(readings) => {
                    for (key, reading) in readings {
                        info!("{} {:?}", key, reading);
                        devices.insert(key, DeviceRecord { dat: reading, ut: now });
                    }
                }
                Err(e) => error!("{}: no climate data this cycle: {}", appliance.key, e),
            }
        }
        devices
    }

    /// Generation and itemized consumption of one appliance
    pub async fn read_power(&self, appliance: &ApplianceConfig) -> Result<Reading, ScrapeError> {
        let generation = self
            .fetch_page(appliance, GENERATION_PAGE, pages::parse_generation_page)
            .await?;

        // Pages are ordered by consumption, the first zero entry ends the scan
        let mut usage: Vec<Entry> = Vec::new();
        let mut finished = false;
        for rank in 1..=MAX_USAGE_PAGES {
            let page = self
                .fetch_page(appliance, &usage_page(rank), pages::parse_usage_page)
                .await?;
            usage.extend(page.entries);
            if page.last {
                finished = true;
                break;
            }
        }
        if !finished {
            warn!(
                "{}: stopped consumption scan after {} pages",
                appliance.key, MAX_USAGE_PAGES
            );
        }

        if appliance.difcalc {
            let itemized: i64 = usage.iter().map(|e| e.0).sum();
            if let Some(rest) = unaccounted_watts(generation.total_kw, itemized) {
                usage.push(Entry(rest, appliance.difname.clone()));
            }
        }

        Ok(Reading::new()
            .with("gen", vec![Entry(generation.watts, generation.title)])
            .with("use", usage))
    }

    /// Air conditioner temperature/humidity pairs shown by the appliance
    pub async fn read_climate(
        &self,
        appliance: &ApplianceConfig,
    ) -> Result<Vec<(String, Reading)>, ScrapeError> {
        let readings = self
            .fetch_page(appliance, ENVIRONMENT_PAGE, pages::parse_environment_page)
            .await?;
        Ok(readings
            .into_iter()
            .map(|c| {
                (
                    climate_key(c.index),
                    Reading::new()
                        .with("dcE1", c.tenths)
                        .with("rh", c.humidity)
                        .with("name", c.name),
                )
            })
            .collect())
    }

    /// Fetch and parse one page under the retry budget
    async fn fetch_page<T>(
        &self,
        appliance: &ApplianceConfig,
        path: &str,
        parse: fn(&[u8]) -> Result<T, PageError>,
    ) -> Result<T, ScrapeError> {
        let what = format!("http://{}/{}", appliance.addr, path);
        with_retry(self.attempts, self.retry_delay, &what, || async move {
            let body = self
                .fetcher
                .fetch(appliance, path)
                .await
                .map_err(|source| ScrapeError::Transport {
                    path: path.to_string(),
                    source,
                })?;
            parse(&body).map_err(|source| {
                self.capture(&body);
                ScrapeError::Format {
                    path: path.to_string(),
                    source,
                }
            })
        })
        .await
    }

    /// Keep the latest malformed response for offline analysis
    fn capture(&self, body: &[u8]) {
        if let Err(e) = std::fs::write(&self.error_file, body) {
            error!("Failed to write {}: {}", self.error_file.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const GEN_PAGE: &str = r#"<div id="g_d_1_capacity">123W</div><div id="g_d_1_title">Solar</div><div id="u_capacity">0.5</div>"#;

    #[derive(Default)]
    struct FakeFetcher {
        pages: HashMap<String, String>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn page(mut self, path: &str, body: &str) -> Self {
            self.pages.insert(path.to_string(), body.to_string());
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, _: &ApplianceConfig, path: &str) -> Result<Vec<u8>, FetchError> {
            self.requests.lock().unwrap().push(path.to_string());
            self.pages
                .get(path)
                .map(|body| body.clone().into_bytes())
                .ok_or(FetchError::Status(StatusCode::NOT_FOUND))
        }
    }

    fn appliance(difcalc: bool) -> ApplianceConfig {
        ApplianceConfig {
            key: "hems".to_string(),
            addr: "192.168.0.216".to_string(),
            sec: ("aiseg".to_string(), "secret".to_string()),
            difcalc,
            difname: "Other".to_string(),
        }
    }

    fn build(
        fetcher: FakeFetcher,
        difcalc: bool,
        dir: &tempfile::TempDir,
    ) -> ApplianceScraper<FakeFetcher> {
        ApplianceScraper::new(fetcher, vec![appliance(difcalc)], 2, dir.path().join("err.txt"))
            .with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn unaccounted_consumption_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default().page(GENERATION_PAGE, GEN_PAGE).page(
            &usage_page(1),
            r#"<div class="c_value">300W</div><div class="c_device">Living</div>
               <div class="c_value">0W</div><div class="c_device">x</div>"#,
        );
        let scraper = build(fetcher, true, &dir);

        let reading = scraper.read_power(&appliance(true)).await.unwrap();
        let json = serde_json::to_string(&reading).unwrap();
        assert_eq!(
            json,
            r#"{"gen":[[123,"Solar"]],"use":[[300,"Living"],[200,"Other"]]}"#
        );
        // the zero entry ends the scan, page 2 is never requested
        assert_eq!(
            scraper.fetcher.requests(),
            vec![GENERATION_PAGE.to_string(), usage_page(1)]
        );
    }

    #[tokio::test]
    async fn scan_walks_pages_until_zero() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .page(GENERATION_PAGE, GEN_PAGE)
            .page(
                &usage_page(1),
                r#"<div class="c_value">300W</div><div class="c_device">A</div>"#,
            )
            .page(
                &usage_page(2),
                r#"<div class="c_value">250W</div><div class="c_device">B</div>"#,
            )
            .page(
                &usage_page(3),
                r#"<div class="c_value">0W</div><div class="c_device">C</div>"#,
            );
        let scraper = build(fetcher, true, &dir);

        let reading = scraper.read_power(&appliance(true)).await.unwrap();
        // 550 W itemized exceeds the 500 W aggregate, no negative entry
        assert_eq!(
            reading.breakdown("use").unwrap(),
            &[Entry(300, "A".to_string()), Entry(250, "B".to_string())][..]
        );
        assert_eq!(scraper.fetcher.requests().len(), 4);
        assert!(!scraper.fetcher.requests().contains(&usage_page(4)));
    }

    #[tokio::test]
    async fn format_error_retries_and_captures_body() {
        let dir = tempfile::tempdir().unwrap();
        let broken = r#"<div id="g_d_1_capacity">5W</div>"#;
        let fetcher = FakeFetcher::default().page(GENERATION_PAGE, broken);
        let scraper = build(fetcher, false, &dir);

        let result = scraper.read_power(&appliance(false)).await;
        assert!(matches!(result, Err(ScrapeError::Format { .. })));
        assert_eq!(scraper.fetcher.requests().len(), 3);
        let captured = std::fs::read_to_string(dir.path().join("err.txt")).unwrap();
        assert_eq!(captured, broken);
    }

    #[tokio::test]
    async fn failed_appliance_contributes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        // usage page missing: transport failure after the generation page succeeded
        let fetcher = FakeFetcher::default().page(GENERATION_PAGE, GEN_PAGE);
        let scraper = build(fetcher, true, &dir);

        let devices = scraper.poll(1000).await;
        assert!(devices.is_empty());
        assert!(!dir.path().join("err.txt").exists());
    }

    #[tokio::test]
    async fn climate_failure_keeps_power_data() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default().page(GENERATION_PAGE, GEN_PAGE).page(
            &usage_page(1),
            r#"<div class="c_value">0W</div><div class="c_device">x</div>"#,
        );
        let scraper = build(fetcher, false, &dir);

        let devices = scraper.poll(1000).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices["hems"].ut, 1000);
        assert_eq!(devices["hems"].dat.breakdown("use").unwrap().len(), 0);
    }

    #[test]
    fn shortfall_is_rounded_and_positive_only() {
        assert_eq!(unaccounted_watts(0.5, 300), Some(200));
        assert_eq!(unaccounted_watts(0.29, 0), Some(290));
        assert_eq!(unaccounted_watts(0.5, 500), None);
        assert_eq!(unaccounted_watts(0.5, 520), None);
    }
}
