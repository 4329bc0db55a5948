//! HTTP client for the upstream events API.

use super::EventFeed;
use crate::BoxedFuture;
use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;
use usermirror_core::{DEFAULT_PAGE_LIMIT, EventPage, ListEventsRequest};

/// Longest response body excerpt kept in [`Error::Feed`].
const ERROR_BODY_LIMIT: usize = 512;

/// Configuration for [`HttpEventFeed`].
#[derive(Clone)]
pub struct HttpFeedConfig {
    /// API root, e.g. `https://api.workos.com`.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_key: String,
    /// Events requested per page.
    pub page_limit: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpFeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.workos.com".to_string(),
            api_key: String::new(),
            page_limit: DEFAULT_PAGE_LIMIT,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for HttpFeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeedConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("page_limit", &self.page_limit)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Reads the upstream `GET /events` endpoint.
#[derive(Debug)]
pub struct HttpEventFeed {
    client: reqwest::Client,
    config: HttpFeedConfig,
}

impl HttpEventFeed {
    pub fn new(mut config: HttpFeedConfig) -> Result<Self> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("usermirror/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    fn query_params(&self, request: &ListEventsRequest) -> Vec<(&'static str, String)> {
        let mut params: Vec<(&'static str, String)> = request
            .event_types
            .iter()
            .map(|t| ("events", t.clone()))
            .collect();
        if let Some(after) = &request.after {
            params.push(("after", after.clone()));
        }
        if let Some(range_start) = &request.range_start {
            params.push(("range_start", range_start.clone()));
        }
        params.push(("limit", self.config.page_limit.to_string()));
        params.push(("order", "asc".to_string()));
        params
    }

    async fn fetch(&self, request: &ListEventsRequest) -> Result<EventPage> {
        let url = format!("{}/events", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .query(&self.query_params(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Feed {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        let page: EventPage = response.json().await?;
        tracing::trace!(
            "Fetched {} events (after={:?}, next={:?})",
            page.data.len(),
            request.after,
            page.next_cursor()
        );
        Ok(page)
    }
}

impl EventFeed for HttpEventFeed {
    fn name(&self) -> &'static str {
        "http"
    }

    fn list_events<'a>(&'a self, request: &'a ListEventsRequest) -> BoxedFuture<'a, Result<EventPage>> {
        Box::pin(self.fetch(request))
    }
}
