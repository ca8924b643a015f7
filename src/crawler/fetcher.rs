//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients with the configured user agent
//! - GET requests to fetch page content under a per-request timeout
//! - Classifying failures as transient (retry) or permanent (give up)

use crate::config::FetcherConfig;
use crate::FetchError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Source of raw page documents
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches the document at `url`, giving up after `timeout`
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The fetcher configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &FetcherConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches pages over HTTP with reqwest
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(build_http_client(config)?))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    /// Fetches a URL and classifies any failure
    ///
    /// # Error Classification
    ///
    /// | Condition | Class |
    /// |-----------|-------|
    /// | Timeout | Transient |
    /// | Connection refused/reset | Transient |
    /// | HTTP 429 | Transient |
    /// | HTTP 5xx | Transient |
    /// | Body read interrupted | Transient |
    /// | Any other non-2xx status | Permanent |
    /// | Malformed request/URL | Permanent |
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_request_error(url, &e))?;

        let status = response.status();
        if let Some(error) = classify_status(url, status) {
            return Err(error);
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::transient(url, format!("failed to read body: {}", e)))
    }
}

/// Maps a non-success status to a fetch error, or `None` for 2xx
pub fn classify_status(url: &str, status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }

    let message = format!("HTTP {}", status.as_u16());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(FetchError::transient(url, message))
    } else {
        Some(FetchError::permanent(url, message))
    }
}

fn classify_request_error(url: &str, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::transient(url, "request timeout")
    } else if error.is_connect() {
        FetchError::transient(url, format!("connection failed: {}", error))
    } else if error.is_builder() {
        FetchError::permanent(url, error.to_string())
    } else {
        FetchError::transient(url, error.to_string())
    }
}
