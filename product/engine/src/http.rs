use crate::config::PipelineConfig;
use crate::extract::PageSource;
use crate::recognition::ImageSource;
use crate::{EngineError, Result};
use std::io::Read;
use std::time::Duration;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const MAX_PAGE_HTML_BYTES: u64 = 8 * 1024 * 1024;

/// Blocking HTTP client shared by page and image fetches.
#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
    max_image_bytes: u64,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout_secs: u64, max_image_bytes: u64) -> Self {
        Self {
            agent: build_http_agent(user_agent, timeout_secs),
            max_image_bytes: max_image_bytes.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            &config.user_agent,
            config.timeout_secs,
            config.max_image_bytes,
        )
    }

    pub fn agent(&self) -> &ureq::Agent {
        &self.agent
    }

    pub fn get_text(&self, url: &str) -> Result<String> {
        let bytes = self.get_bytes_limited(url, MAX_PAGE_HTML_BYTES)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.get_bytes_limited(url, self.max_image_bytes)
    }

    fn get_bytes_limited(&self, url: &str, limit: u64) -> Result<Vec<u8>> {
        let mut response = self.agent.get(url).call().map_err(|e| EngineError::Fetch {
            url: redact_url_for_log(url),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Fetch {
                url: redact_url_for_log(url),
                message: format!("unexpected status {}", status.as_u16()),
            });
        }

        // One byte past the cap tells an oversized body from one that fits.
        let mut buf = Vec::new();
        response
            .body_mut()
            .as_reader()
            .take(limit.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| EngineError::Fetch {
                url: redact_url_for_log(url),
                message: format!("failed to read body: {e}"),
            })?;
        if buf.len() as u64 > limit {
            return Err(EngineError::Fetch {
                url: redact_url_for_log(url),
                message: format!("body exceeds {limit} bytes"),
            });
        }
        Ok(buf)
    }
}

impl PageSource for HttpClient {
    fn fetch_html(&self, url: &str) -> Result<String> {
        self.get_text(url)
    }
}

impl ImageSource for HttpClient {
    fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self.get_bytes(url)?;
        tracing::debug!(
            url = %redact_url_for_log(url),
            bytes = bytes.len(),
            "image_downloaded"
        );
        Ok(bytes)
    }
}

pub fn build_http_agent(user_agent: &str, timeout_secs: u64) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(timeout_secs.max(1))))
        .user_agent(user_agent);
    config.build().into()
}

/// Keeps only `scheme://host/...` so query tokens never reach the logs.
pub fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value) {
        Ok(uri) => {
            let scheme = uri.scheme();
            let authority = uri.host_str().unwrap_or("unknown-host");
            format!("{scheme}://{authority}/...")
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}
