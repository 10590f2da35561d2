//! HTTP fetch utilities and the store adapters the sync pipeline writes through.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod document;
pub mod rows;

pub use document::{DocumentStore, JsonFileStore, RealtimeDbStore};
pub use rows::{
    MemoryRowStore, PgRowStore, Row, RowInsert, RowPlan, RowStore, RowUpdate, ScopeSpec, TableSpec,
};

pub const CRATE_NAME: &str = "osync-storage";

/// How an endpoint delivers the text the parser consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    /// JSON envelope `{"content": "..."}` around prose.
    JsonContent,
    Html,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("{url} is {bytes} bytes, over the {limit} byte limit")]
    TooLarge { url: String, bytes: u64, limit: u64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("document store returned status {status} for {path}")]
    Status { status: u16, path: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("missing table: {0}")]
    MissingTable(String),
    #[error("{0}")]
    Rejected(String),
}

/// Headers-only view of a downloadable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProbe {
    pub size: u64,
    pub content_type: Option<String>,
}

/// Everything a category pipeline needs from the network.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, url: &str, kind: ContentKind) -> Result<String, FetchError>;
    async fn probe(&self, url: &str) -> Result<FileProbe, FetchError>;
    async fn download(&self, url: &str, limit_bytes: u64) -> Result<Vec<u8>, FetchError>;
}

/// Unwraps the `content` string of a JSON endpoint.
pub fn decode_content(url: &str, kind: ContentKind, body: &[u8]) -> Result<String, FetchError> {
    let text = String::from_utf8_lossy(body).into_owned();
    match kind {
        ContentKind::Html => Ok(text),
        ContentKind::JsonContent => {
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| FetchError::Decode {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            value
                .get("content")
                .and_then(|c| c.as_str())
                .map(ToString::to_string)
                .ok_or_else(|| FetchError::Decode {
                    url: url.to_string(),
                    reason: "missing string field `content`".to_string(),
                })
        }
    }
}

/// Pauses between the attempts of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Attempts including the first one.
    pub attempts: u32,
    pub first_pause: Duration,
    pub longest_pause: Duration,
}

impl RetrySchedule {
    /// Pause before retry number `retry` (1-based). Doubles from
    /// `first_pause`; a server `Retry-After` replaces the doubling. Both are
    /// capped at `longest_pause`.
    pub fn pause(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        retry_after
            .unwrap_or_else(|| self.first_pause.saturating_mul(factor))
            .min(self.longest_pause)
    }

    fn allows(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

/// Answers worth another attempt: server errors, throttling, request timeout.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Timeouts, refused connections and bodies cut mid-transfer.
fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body()
}

/// `Retry-After` in seconds; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Pages and HEAD probes.
    pub retries: RetrySchedule,
    /// File bodies; an interrupted transfer starts over.
    pub download_retries: RetrySchedule,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retries: RetrySchedule {
                attempts: 3,
                first_pause: Duration::from_millis(500),
                longest_pause: Duration::from_secs(5),
            },
            download_retries: RetrySchedule {
                attempts: 2,
                first_pause: Duration::from_secs(2),
                longest_pause: Duration::from_secs(10),
            },
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retries: RetrySchedule,
    download_retries: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(options: FetcherOptions) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(options.timeout);

        if let Some(user_agent) = &options.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retries: options.retries,
            download_retries: options.download_retries,
        })
    }

    /// Shared connection pool, reused by the realtime DB adapter.
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Successful response, retrying transient failures on `self.retries`.
    async fn send(&self, method: Method, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 1;
        loop {
            match self.client.request(method.clone(), url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if !is_transient_status(status) || !self.retries.allows(attempt) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    let pause = self.retries.pause(attempt, retry_after(resp.headers()));
                    debug!(%status, attempt, ?pause, "retrying after server status");
                    tokio::time::sleep(pause).await;
                }
                Err(err) => {
                    if !is_transient_error(&err) || !self.retries.allows(attempt) {
                        return Err(FetchError::Request(err));
                    }
                    let pause = self.retries.pause(attempt, None);
                    debug!(error = %err, attempt, ?pause, "retrying after request error");
                    tokio::time::sleep(pause).await;
                }
            }
            attempt += 1;
        }
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .send(Method::GET, url)
            .instrument(info_span!("http_fetch", url))
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// One GET of a file body, stopped as soon as it outgrows `limit_bytes`.
    async fn read_limited(&self, url: &str, limit_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let too_large = |bytes: u64| FetchError::TooLarge {
            url: url.to_string(),
            bytes,
            limit: limit_bytes,
        };
        let mut resp = self.send(Method::GET, url).await?;
        if let Some(declared) = content_length(resp.headers()) {
            if declared > limit_bytes {
                return Err(too_large(declared));
            }
        }
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > limit_bytes {
                return Err(too_large(body.len() as u64));
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl ContentSource for HttpFetcher {
    async fn fetch(&self, url: &str, kind: ContentKind) -> Result<String, FetchError> {
        let body = self.fetch_bytes(url).await?;
        decode_content(url, kind, &body)
    }

    /// HEAD, or the headers of a GET when the server refuses HEAD.
    async fn probe(&self, url: &str) -> Result<FileProbe, FetchError> {
        let resp = match self
            .send(Method::HEAD, url)
            .instrument(info_span!("http_probe", url))
            .await
        {
            Err(FetchError::HttpStatus { status, .. })
                if status == StatusCode::METHOD_NOT_ALLOWED.as_u16()
                    || status == StatusCode::NOT_IMPLEMENTED.as_u16() =>
            {
                debug!(url, status, "HEAD refused, probing with GET");
                self.send(Method::GET, url)
                    .instrument(info_span!("http_probe", url))
                    .await?
            }
            other => other?,
        };
        let headers = resp.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        Ok(FileProbe {
            size: content_length(headers).unwrap_or(0),
            content_type,
        })
    }

    async fn download(&self, url: &str, limit_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 1;
        loop {
            let result = self
                .read_limited(url, limit_bytes)
                .instrument(info_span!("http_download", url, attempt))
                .await;
            match result {
                Err(FetchError::Request(err))
                    if err.is_body() && self.download_retries.allows(attempt) =>
                {
                    let pause = self.download_retries.pause(attempt, None);
                    debug!(error = %err, attempt, ?pause, "download interrupted, starting over");
                    tokio::time::sleep(pause).await;
                }
                other => return other,
            }
            attempt += 1;
        }
    }
}

/// Serves fixed pages and files, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticContentSource {
    pages: HashMap<String, String>,
    files: HashMap<String, (Vec<u8>, Option<String>)>,
}

impl StaticContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }

    pub fn with_file(
        mut self,
        url: impl Into<String>,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Self {
        self.files
            .insert(url.into(), (bytes, content_type.map(ToString::to_string)));
        self
    }

    fn not_found(url: &str) -> FetchError {
        FetchError::HttpStatus {
            status: StatusCode::NOT_FOUND.as_u16(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl ContentSource for StaticContentSource {
    async fn fetch(&self, url: &str, kind: ContentKind) -> Result<String, FetchError> {
        let body = self.pages.get(url).ok_or_else(|| Self::not_found(url))?;
        decode_content(url, kind, body.as_bytes())
    }

    async fn probe(&self, url: &str) -> Result<FileProbe, FetchError> {
        let (bytes, content_type) = self.files.get(url).ok_or_else(|| Self::not_found(url))?;
        Ok(FileProbe {
            size: bytes.len() as u64,
            content_type: content_type.clone(),
        })
    }

    async fn download(&self, url: &str, limit_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let (bytes, _) = self.files.get(url).ok_or_else(|| Self::not_found(url))?;
        if bytes.len() as u64 > limit_bytes {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                bytes: bytes.len() as u64,
                limit: limit_bytes,
            });
        }
        Ok(bytes.clone())
    }
}
