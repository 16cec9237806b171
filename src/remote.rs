//! Remote feed source: the network side of synchronization.
//!
//! The sync engine talks to the remote through the [`FeedSource`] trait so the
//! coordinator never depends on transport details. [`HttpFeedSource`] is the
//! production implementation over a JSON API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::storage::Link;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Error Types
// ============================================================================

/// Errors from the remote source.
///
/// Transport failures (`Network`, `Timeout`, `HttpStatus`) are retried only on
/// the next sync trigger; `Malformed` aborts the current phase without
/// touching already-applied local state.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body could not be decoded
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

fn request_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_decode() {
        RemoteError::Malformed(e.to_string())
    } else {
        RemoteError::Network(e)
    }
}

// ============================================================================
// Wire Descriptors
// ============================================================================

/// Feed metadata as served by the remote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedDescriptor {
    pub id: String,
    pub url: String,
    pub title: String,
}

/// Entry as served by the remote. Flags never travel here; they have their
/// own push/pull channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub published: i64,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub og_image_url: Option<String>,
    #[serde(default)]
    pub og_image_width: Option<i64>,
    #[serde(default)]
    pub og_image_height: Option<i64>,
}

/// One locally mutated flag value being pushed remotely.
/// A `None` field means that flag has no pending local change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagPush {
    pub entry_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmarked: Option<bool>,
}

/// Remote truth for one entry's flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagState {
    pub entry_id: String,
    pub read: bool,
    pub bookmarked: bool,
}

// ============================================================================
// Feed Source Trait
// ============================================================================

/// The remote side of sync. Implemented over HTTP in production and mocked
/// at the HTTP layer in tests.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Full feed list with current metadata
    async fn fetch_feeds(&self) -> Result<Vec<FeedDescriptor>, RemoteError>;

    /// Resolve a feed by URL (subscribe handshake)
    async fn fetch_feed(&self, url: &str) -> Result<FeedDescriptor, RemoteError>;

    /// Entries of a feed published after `since` (None = everything)
    async fn fetch_entries(
        &self,
        feed_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<EntryDescriptor>, RemoteError>;

    /// Push pending local flag mutations
    async fn push_flags(&self, pending: &[FlagPush]) -> Result<(), RemoteError>;

    /// Pull remote flag state for all entries
    async fn pull_flags(&self) -> Result<Vec<FlagState>, RemoteError>;

    /// Remove a feed subscription remotely
    async fn delete_feed(&self, feed_id: &str) -> Result<(), RemoteError>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// JSON API client for the remote feed source
pub struct HttpFeedSource {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpFeedSource {
    pub fn new(base: Url, token: Option<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RemoteError::Network)?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::Malformed(format!("invalid endpoint {}: {}", path, e)))
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = self.apply_auth(request).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        let response = self.send(self.client.get(url)).await?;
        response.json().await.map_err(request_error)
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_feeds(&self) -> Result<Vec<FeedDescriptor>, RemoteError> {
        self.get_json(self.endpoint("v1/feeds")?).await
    }

    async fn fetch_feed(&self, url: &str) -> Result<FeedDescriptor, RemoteError> {
        let endpoint = self.endpoint("v1/feeds")?;
        let response = self
            .send(self.client.post(endpoint).json(&serde_json::json!({ "url": url })))
            .await?;
        response.json().await.map_err(request_error)
    }

    async fn fetch_entries(
        &self,
        feed_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<EntryDescriptor>, RemoteError> {
        let mut endpoint = self.endpoint(&format!("v1/feeds/{}/entries", feed_id))?;
        if let Some(since) = since {
            endpoint
                .query_pairs_mut()
                .append_pair("since", &since.to_string());
        }
        self.get_json(endpoint).await
    }

    async fn push_flags(&self, pending: &[FlagPush]) -> Result<(), RemoteError> {
        let endpoint = self.endpoint("v1/entries/flags")?;
        self.send(self.client.put(endpoint).json(pending)).await?;
        Ok(())
    }

    async fn pull_flags(&self) -> Result<Vec<FlagState>, RemoteError> {
        self.get_json(self.endpoint("v1/entries/flags")?).await
    }

    async fn delete_feed(&self, feed_id: &str) -> Result<(), RemoteError> {
        let endpoint = self.endpoint(&format!("v1/feeds/{}", feed_id))?;
        self.send(self.client.delete(endpoint)).await?;
        Ok(())
    }
}
