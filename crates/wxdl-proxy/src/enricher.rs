//! Active enrichment of newly discovered accounts.
//!
//! When the dispatcher sees a username for the first time it schedules two
//! GETs against the platform API, one for the account profile and one for
//! its feed. Whatever JSON comes back is fed through the same extractor the
//! passive path uses. Each call is attempted once; failures only cost the
//! extra detail.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde_json::Value;
use url::Url;

use wxdl_core::{MetadataExtractor, SourceUrl};

use crate::error::EnrichError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
pub const ACCEPT_JSON: &str = "application/json, text/plain, */*";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const PROFILE_PATH: &str = "/api/profile.getProfile";
const FEEDS_PATH: &str = "/api/feeds.getFeedsProfile";
const REQUEST_ID_LEN: usize = 16;

/// Transport used for enrichment calls.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get_json(&self, url: &Url) -> Result<Value, EnrichError>;
}

/// `reqwest` transport with a desktop browser identity.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    client: reqwest::Client,
}

impl HttpApiClient {
    pub fn new(timeout: Duration) -> Result<Self, EnrichError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get_json(&self, url: &Url) -> Result<Value, EnrichError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrichError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Random alphanumeric id sent with feed requests.
pub fn request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(char::from)
        .collect()
}

pub fn profile_url(api_host: &str, username: &str) -> Result<Url, EnrichError> {
    let base = format!("https://{}{}", api_host, PROFILE_PATH);
    Ok(Url::parse_with_params(&base, &[("username", username)])?)
}

pub fn feeds_url(api_host: &str, username: &str, request_id: &str) -> Result<Url, EnrichError> {
    let base = format!("https://{}{}", api_host, FEEDS_PATH);
    Ok(Url::parse_with_params(
        &base,
        &[("username", username), ("query_request_id", request_id)],
    )?)
}

/// Fetches profile and feed data for new accounts.
#[derive(Clone)]
pub struct Enricher {
    client: Arc<dyn ApiClient>,
    extractor: MetadataExtractor,
    api_host: String,
}

impl fmt::Debug for Enricher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enricher")
            .field("client", &"ApiClient")
            .field("api_host", &self.api_host)
            .finish()
    }
}

impl Enricher {
    pub fn new(
        client: Arc<dyn ApiClient>,
        extractor: MetadataExtractor,
        api_host: impl Into<String>,
    ) -> Self {
        Self {
            client,
            extractor,
            api_host: api_host.into(),
        }
    }

    /// Spawns enrichment for `username` on the current runtime and returns
    /// immediately.
    pub fn schedule(&self, username: &str) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No async runtime, skipping enrichment for {}", username);
                return;
            }
        };

        let enricher = self.clone();
        let username = username.to_string();
        handle.spawn(async move {
            let applied = enricher.enrich(&username).await;
            tracing::debug!("Enrichment for {} applied {} records", username, applied);
        });
    }

    /// Runs both calls concurrently and returns how many records they added.
    pub async fn enrich(&self, username: &str) -> usize {
        let profile = profile_url(&self.api_host, username);
        let feeds = feeds_url(&self.api_host, username, &request_id());

        let (from_profile, from_feeds) =
            futures::future::join(self.fetch("profile", profile), self.fetch("feeds", feeds)).await;
        from_profile + from_feeds
    }

    async fn fetch(&self, endpoint: &str, url: Result<Url, EnrichError>) -> usize {
        let result = match url {
            Ok(url) => self.client.get_json(&url).await.map(|value| (url, value)),
            Err(e) => Err(e),
        };

        match result {
            Ok((url, value)) => self
                .extractor
                .ingest_value(&SourceUrl::parse(url.as_str()), &value),
            Err(e) => {
                tracing::debug!("Enrichment {} call failed: {}", endpoint, e);
                0
            }
        }
    }
}
