use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ReadAt, check_bounds};
use crate::error::SourceError;

/// Default number of attempts for timeouts and connection failures
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Default limit for one request, body included
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// HTTP Range reader for remote archives
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    transferred_bytes: AtomicU64,
    max_retry: u32,
}

impl HttpRangeReader {
    /// Create a new HTTP Range reader
    ///
    /// This will send a HEAD request to verify Range support and get file size
    pub async fn new(url: String) -> Result<Self, SourceError> {
        Self::with_timeout(url, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Like [`HttpRangeReader::new`], bounding each request by `timeout`
    pub async fn with_timeout(url: String, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;

        let resp = client.head(&url).send().await?;

        if !resp.status().is_success() {
            return Err(SourceError::Status(resp.status().as_u16()));
        }

        let accept_ranges = resp
            .headers()
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");

        if !accept_ranges.contains("bytes") {
            return Err(SourceError::RangeUnsupported);
        }

        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or(SourceError::MissingLength)?;

        debug!(url = %url, size, "opened remote archive");

        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
            max_retry: DEFAULT_MAX_RETRY,
        })
    }

    /// Override the number of attempts made for transient failures
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry.max(1);
        self
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, SourceError> {
        check_bounds(offset, len, self.size)?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let end = offset + len as u64 - 1;
        let mut buf = BytesMut::with_capacity(len);
        let mut retry_count = 0;

        // A server may cut a large range short; keep asking for the remainder
        while buf.len() < len {
            let current_start = offset + buf.len() as u64;
            let range = format!("bytes={}-{}", current_start, end);

            // Body errors go through the same retry path as send errors
            let result = match self
                .client
                .get(&self.url)
                .header("Range", &range)
                .send()
                .await
            {
                Ok(resp) => match resp.status() {
                    StatusCode::PARTIAL_CONTENT => resp.bytes().await,
                    StatusCode::OK => return Err(SourceError::RangeUnsupported),
                    status => return Err(SourceError::Status(status.as_u16())),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        return Err(SourceError::ShortRead {
                            offset,
                            expected: len as u64,
                            actual: buf.len() as u64,
                        });
                    }
                    let chunk_len = bytes.len().min(len - buf.len());
                    buf.extend_from_slice(&bytes[..chunk_len]);

                    self.transferred_bytes
                        .fetch_add(chunk_len as u64, Ordering::Relaxed);
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    retry_count += 1;
                    if retry_count >= self.max_retry {
                        return Err(SourceError::RetriesExhausted {
                            attempts: retry_count,
                            last: e.to_string(),
                        });
                    }
                    warn!(
                        range = %range,
                        "connection error, retry {}/{}: {}",
                        retry_count, self.max_retry, e
                    );
                    tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(buf.freeze())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.url
    }
}
