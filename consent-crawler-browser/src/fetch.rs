use crate::error::ExtractionError;
use reqwest::Client;
use reqwest::header::{ACCEPT_LANGUAGE, REFERER};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// HTTP client used by extractors to download consent platform resources.
#[derive(Clone)]
pub struct ResourceFetcher {
    client: Client,
}

impl ResourceFetcher {
    pub fn new() -> Result<Self, ExtractionError> {
        Self::with_timeout(30)
    }

    pub fn with_timeout(timeout_secs: u64) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs.div_ceil(2)))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ExtractionError::Fetch(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// GET `url` as text. Non-success status codes are reported as fetch errors.
    pub async fn get_text(&self, url: &str, referer: Option<&str>) -> Result<String, ExtractionError> {
        debug!("Fetching consent resource {}", url);

        let mut request = self
            .client
            .get(url)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Fetch(format!(
                "{} returned HTTP {}",
                url,
                status.as_u16()
            )));
        }

        Ok(response.text().await?)
    }

    /// GET `url` and decode the body as JSON. OneTrust serves its files with a
    /// UTF-8 byte order mark, which is stripped first.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, ExtractionError> {
        let body = self.get_text(url, None).await?;
        let body = body.trim_start_matches('\u{feff}');
        serde_json::from_str(body)
            .map_err(|e| ExtractionError::Malformed(format!("{} is not valid JSON: {}", url, e)))
    }
}
