/// HTTP access to the appliance web UI
use async_trait::async_trait;
use log::debug;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tokio::time::Duration;
use url::{Position, Url};

use crate::config::ApplianceConfig;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("bad url: {0}")]
    Url(#[from] url::ParseError),
    #[error("digest authentication failed: {0}")]
    Digest(String),
    #[error("unexpected status {0}")]
    Status(StatusCode),
}

/// Fetches one page of an appliance's UI as raw bytes
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, appliance: &ApplianceConfig, path: &str) -> Result<Vec<u8>, FetchError>;
}

/// reqwest client answering the appliance's digest challenge
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a client whose every request gives up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

/// `http://{addr}/{path}` with `path` possibly carrying a query string
pub fn page_url(addr: &str, path: &str) -> Result<Url, FetchError> {
    Ok(Url::parse(&format!("http://{}/", addr))?.join(path)?)
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, appliance: &ApplianceConfig, path: &str) -> Result<Vec<u8>, FetchError> {
        let url = page_url(&appliance.addr, path)?;
        let mut response = self.client.get(url.clone()).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| FetchError::Digest("missing challenge".to_string()))?
                .to_string();
            let mut prompt =
                digest_auth::parse(&challenge).map_err(|e| FetchError::Digest(e.to_string()))?;
            let context = digest_auth::AuthContext::new(
                appliance.sec.0.as_str(),
                appliance.sec.1.as_str(),
                &url[Position::BeforePath..],
            );
            let answer = prompt
                .respond(&context)
                .map_err(|e| FetchError::Digest(e.to_string()))?;
            debug!("Digest response for {}", url);
            response = self
                .client
                .get(url.clone())
                .header(AUTHORIZATION, answer.to_header_string())
                .send()
                .await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        Ok(response.bytes().await?.to_vec())
    }
}
