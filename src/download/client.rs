//! HTTP client wrapper for probing origins and fetching byte ranges.
//!
//! Responses are never transparently decompressed: byte ranges must address
//! the raw body the origin stores.

use std::time::Duration;

use reqwest::Client;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE, RETRY_AFTER};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, PROBE_RANGE, READ_TIMEOUT_SECS};
use super::error::DownloadError;

/// Default User-Agent for origin requests (identifies the tool; RFC 9308).
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("transfer-engine/{version}")
}

/// What a range probe learned about an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// The origin answered the probe with `206 Partial Content`.
    pub range_capable: bool,
    /// Total body size, when reported.
    pub total: Option<u64>,
}

/// HTTP client shared by planners and chunk workers.
///
/// Created once and cloned freely; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialised.
    #[instrument(level = "debug")]
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(default_user_agent())
            .build()?;
        Ok(Self { client })
    }

    /// Creates a client with the default timeouts (30s connect, 5min read).
    ///
    /// # Errors
    ///
    /// As [`HttpClient::new`].
    pub fn with_default_timeouts() -> Result<Self, reqwest::Error> {
        Self::new(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Probes `url` with `Range: bytes=0-0`.
    ///
    /// A `206` carrying `Content-Range: bytes 0-0/N` means the origin serves
    /// ranges over an N-byte body. A `200` means it ignores ranges; its
    /// `Content-Length`, if any, is the body size. The probe body is dropped.
    ///
    /// # Errors
    ///
    /// Returns the transport or HTTP status error.
    #[instrument(skip(self))]
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        let response = self.send_request(url, Some(PROBE_RANGE)).await?;

        let result = if response.status() == StatusCode::PARTIAL_CONTENT {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total);
            ProbeResult {
                range_capable: total.is_some(),
                total,
            }
        } else {
            ProbeResult {
                range_capable: false,
                total: response.content_length(),
            }
        };

        debug!(status = response.status().as_u16(), ?result, "probe answered");
        Ok(result)
    }

    /// Starts a GET of `url`, optionally restricted to the inclusive byte range
    /// `(first, last)`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::RangeIgnored`] when a ranged request is
    /// answered with the whole body, otherwise the transport or status error.
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<reqwest::Response, DownloadError> {
        let header = range.map(|(first, last)| format!("bytes={first}-{last}"));
        let response = self.send_request(url, header.as_deref()).await?;

        if range.is_some() && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::RangeIgnored {
                url: url.to_string(),
            });
        }

        Ok(response)
    }

    async fn send_request(
        &self,
        url: &str,
        range_header: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }

        let mut request = self.client.get(parsed);
        if let Some(range) = range_header {
            request = request.header(RANGE, range);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) if error.is_timeout() => return Err(DownloadError::timeout(url)),
            Err(error) => return Err(DownloadError::network(url, error)),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        debug!(status = status.as_u16(), ?retry_after, "origin refused request");
        Err(DownloadError::http_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ))
    }

}

/// Parses the complete length out of `bytes 0-0/1234`. `*` yields `None`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::with_default_timeouts().unwrap()
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/10000000"), Some(10_000_000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/5"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_user_agent_carries_version() {
        let ua = default_user_agent();
        assert!(ua.starts_with("transfer-engine/"));
        assert!(ua.contains(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn test_probe_range_capable_origin() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/big.bin"))
            .and(header("range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-0/4096")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let probe = client()
            .probe(&format!("{}/big.bin", server.uri()))
            .await
            .unwrap();
        assert_eq!(
            probe,
            ProbeResult {
                range_capable: true,
                total: Some(4096)
            }
        );
    }

    #[tokio::test]
    async fn test_probe_range_incapable_origin() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/plain.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 300]))
            .mount(&server)
            .await;

        let probe = client()
            .probe(&format!("{}/plain.bin", server.uri()))
            .await
            .unwrap();
        assert!(!probe.range_capable);
        assert_eq!(probe.total, Some(300));
    }

    #[tokio::test]
    async fn test_fetch_rejects_ignored_range() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"whole body".to_vec()))
            .mount(&server)
            .await;

        let result = client()
            .fetch(&format!("{}/x", server.uri()), Some((0, 3)))
            .await;
        assert!(matches!(result, Err(DownloadError::RangeIgnored { .. })));
    }

    #[tokio::test]
    async fn test_rate_limited_response_keeps_retry_after() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let result = client().fetch(&format!("{}/x", server.uri()), None).await;
        match result {
            Err(DownloadError::HttpStatus {
                status,
                retry_after,
                ..
            }) => {
                assert_eq!(status, 429);
                assert_eq!(retry_after.as_deref(), Some("3"));
            }
            other => panic!("expected HTTP 429, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_http_url_is_invalid() {
        let result = client().fetch("ftp://example.com/a.jpg", None).await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
        let result = client().probe("not a url").await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }
}
