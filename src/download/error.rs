//! Errors from probes, chunk fetches and assembly. Their `Display` text is
//! what a failed transfer records as its error.

use thiserror::Error;

use crate::storage::StorageError;
use crate::transfer::StoreError;

/// Errors that can occur while fetching or assembling a transfer.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timed out fetching {url}")]
    Timeout { url: String },

    /// Non-2xx answer. `retry_after` is the raw header, if any.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        retry_after: Option<String>,
    },

    /// Not an http(s) URL.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// A ranged request was answered with the whole body.
    #[error("origin ignored range request for {url}")]
    RangeIgnored { url: String },

    /// The body ended before the chunk's range was filled.
    #[error("short body from {url}: expected {expected} bytes, got {actual}")]
    ShortBody {
        url: String,
        expected: u64,
        actual: u64,
    },

    /// Assembled or part size does not match the planned size.
    #[error(
        "integrity check failed for {key}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        key: String,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// A chunk was not done when assembly started.
    #[error("chunk {index} is not complete")]
    MissingPart { index: i64 },

    /// Temp or permanent storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Chunk or transfer bookkeeping failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job-batch was canceled.
    #[error("transfer canceled")]
    Canceled,
}

impl DownloadError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn short_body(url: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::ShortBody {
            url: url.into(),
            expected,
            actual,
        }
    }

    pub fn integrity(key: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            key: key.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
