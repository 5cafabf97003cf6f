use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use bulkexport_core::error::{Error, Result};
use bulkexport_core::traits::{IndexClient, SearchListener};
use bulkexport_core::types::{SearchRequest, SearchResponse};

use crate::wire::{parse_response, search_body};

fn default_timeout_ms() -> u64 {
    60_000
}

/// Connection settings (`[index]` in the config files).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsClientConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl EsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Clone)]
pub struct EsIndexClient {
    http: Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl EsIndexClient {
    pub fn new(config: &EsClientConfig) -> Result<Self> {
        let mut base = Url::parse(&config.url)
            .map_err(|e| Error::InvalidConfig(format!("index url `{}`: {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "index url `{}` cannot carry a path",
                config.url
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("bulkexport/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// `<base>/<index>/_search`
    pub fn search_url(&self, index_name: &str) -> Result<Url> {
        self.base
            .join(&format!("{index_name}/_search"))
            .map_err(|e| Error::InvalidConfig(format!("index name `{index_name}`: {e}")))
    }

    /// Fetch one page.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let url = self.search_url(&request.index_name)?;
        let mut builder = self.http.post(url.clone()).json(&search_body(request));
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_ref());
        }
        debug!(%url, size = request.page_size, "sending search");

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Index(format!("search request to {url} failed: {e}")))?;
        let status = response.status();
        let payload = response
            .bytes()
            .await
            .map_err(|e| Error::Index(format!("reading search response from {url}: {e}")))?;

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("index `{}`", request.index_name)));
        }
        if !status.is_success() {
            let body = String::from_utf8_lossy(&payload);
            let snippet: String = body.chars().take(512).collect();
            warn!(%url, status = status.as_u16(), "search rejected");
            return Err(Error::Index(format!(
                "HTTP {}: {}",
                status.as_u16(),
                snippet
            )));
        }
        parse_response(&payload)
    }
}

impl IndexClient for EsIndexClient {
    fn search_async(&self, request: SearchRequest, listener: Box<dyn SearchListener>) {
        let client = self.clone();
        tokio::spawn(async move {
            match client.search(&request).await {
                Ok(response) => listener.on_response(response),
                Err(error) => listener.on_failure(error),
            }
        });
    }
}
