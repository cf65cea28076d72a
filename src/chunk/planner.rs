//! Chunk planning: probe the origin, then split the body into byte ranges.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::record::ByteRange;
use crate::download::{
    DownloadError, FailureType, HttpClient, ProbeResult, RateLimiter, RetryDecision, RetryPolicy,
    backoff, classify_error,
};

/// Ranges to fetch for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Total body size, when the origin reported one.
    pub bytes_total: Option<u64>,
    /// Contiguous, non-overlapping ranges in order.
    pub ranges: Vec<ByteRange>,
    /// Whether chunks are fetched with `Range` requests.
    pub ranged: bool,
}

impl ChunkPlan {
    /// Ranged plan over a known total.
    #[must_use]
    pub fn ranged(total: u64, ranges: Vec<ByteRange>) -> Self {
        Self {
            bytes_total: Some(total),
            ranges,
            ranged: true,
        }
    }

    /// Single unranged chunk spanning the whole body.
    #[must_use]
    pub fn whole(total: Option<u64>) -> Self {
        Self {
            bytes_total: total,
            ranges: vec![ByteRange::new(0, total.unwrap_or(0))],
            ranged: false,
        }
    }
}

/// Splits `total` bytes into ranges of `chunk_size`, the last one holding the
/// remainder. When that would exceed `max_chunks`, the chunk size is raised to
/// `ceil(total / max_chunks)`.
#[must_use]
pub fn plan_ranges(total: u64, chunk_size: u64, max_chunks: usize) -> Vec<ByteRange> {
    if total == 0 {
        return Vec::new();
    }
    let max_chunks = u64::try_from(max_chunks.max(1)).unwrap_or(u64::MAX);
    let size = chunk_size.max(1).max(total.div_ceil(max_chunks));

    let mut ranges = Vec::new();
    let mut start = 0;
    while start < total {
        let end = start.saturating_add(size).min(total);
        ranges.push(ByteRange::new(start, end));
        start = end;
    }
    ranges
}

/// Probing planner.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    client: HttpClient,
    limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    chunk_size: u64,
    max_chunks: usize,
}

impl ChunkPlanner {
    #[must_use]
    pub fn new(
        client: HttpClient,
        limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
        chunk_size: u64,
        max_chunks: usize,
    ) -> Self {
        Self {
            client,
            limiter,
            retry_policy,
            chunk_size,
            max_chunks,
        }
    }

    /// Plans the transfer of `url`.
    ///
    /// Only cancellation and hard client errors (a 404, say) are returned as
    /// errors. Every other probe failure degrades to a single unranged chunk,
    /// including a 416, which is how range-capable origins answer `bytes=0-0`
    /// for an empty body.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Canceled`] or the permanent probe error.
    #[instrument(skip(self, cancel))]
    pub async fn plan(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkPlan, DownloadError> {
        let probe = match self.probe_with_retry(url, cancel).await {
            Ok(probe) => probe,
            Err(DownloadError::Canceled) => return Err(DownloadError::Canceled),
            Err(error) if is_hard_client_error(&error) => return Err(error),
            Err(error) => {
                warn!(error = %error, "probe failed, falling back to a single chunk");
                return Ok(ChunkPlan::whole(None));
            }
        };

        let plan = match probe {
            ProbeResult {
                range_capable: true,
                total: Some(total),
            } if total > 0 => {
                ChunkPlan::ranged(total, plan_ranges(total, self.chunk_size, self.max_chunks))
            }
            ProbeResult { total, .. } => ChunkPlan::whole(total),
        };

        info!(
            bytes_total = ?plan.bytes_total,
            chunks = plan.ranges.len(),
            ranged = plan.ranged,
            "planned transfer"
        );
        Ok(plan)
    }

    async fn probe_with_retry(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeResult, DownloadError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.limiter.acquire_or_cancel(url, cancel).await?;

            let result = tokio::select! {
                () = cancel.cancelled() => return Err(DownloadError::Canceled),
                result = self.client.probe(url) => result,
            };

            match result {
                Ok(probe) => return Ok(probe),
                Err(error) => match self.retry_policy.decide(&error, attempt, &self.limiter, url) {
                    RetryDecision::Retry { delay, .. } => {
                        debug!(attempt, delay_ms = delay.as_millis(), error = %error, "retrying probe");
                        backoff(delay, cancel).await?;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(attempt, %reason, "probe not retried");
                        return Err(error);
                    }
                },
            }
        }
    }
}

const RANGE_NOT_SATISFIABLE: u16 = 416;

/// Permanent 4xx answers mean the asset itself is unavailable.
fn is_hard_client_error(error: &DownloadError) -> bool {
    matches!(
        error,
        DownloadError::HttpStatus { status, .. }
            if (400..500).contains(status) && *status != RANGE_NOT_SATISFIABLE
    ) && classify_error(error) == FailureType::Permanent
}
