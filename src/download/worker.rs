//! Chunk fetch worker: streams one byte range into its temp part file.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::client::HttpClient;
use super::constants::PROGRESS_FLUSH_BYTES;
use super::error::DownloadError;
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy, backoff};
use crate::chunk::{ChunkRecord, ChunkStore};
use crate::storage::ObjectStorage;

/// Receives byte deltas as a worker flushes them. Negative deltas rewind
/// progress when an unranged chunk starts over.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn advance(&self, delta: i64);
}

/// Downloads chunks of one transfer into the temp disk.
///
/// One worker value is shared by every chunk task of a batch.
#[derive(Debug, Clone)]
pub struct ChunkFetchWorker {
    client: HttpClient,
    limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    chunks: ChunkStore,
    temp: Arc<dyn ObjectStorage>,
    url: String,
}

impl ChunkFetchWorker {
    #[must_use]
    pub fn new(
        client: HttpClient,
        limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
        chunks: ChunkStore,
        temp: Arc<dyn ObjectStorage>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            limiter,
            retry_policy,
            chunks,
            temp,
            url: url.into(),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches `chunk` until it is complete, retrying within the budget.
    ///
    /// Returns the number of bytes the part file holds. On a non-retryable
    /// error the chunk is marked failed; on cancellation it is left in flight
    /// with its partial bookkeeping flushed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Canceled`] or the error that exhausted the
    /// budget.
    #[instrument(skip(self, chunk, sink, cancel), fields(chunk = chunk.chunk_index, transfer_id = chunk.transfer_id))]
    pub async fn run(
        &self,
        chunk: &ChunkRecord,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        self.chunks.mark_in_flight(chunk.id).await?;

        let mut written = chunk.written();
        if written == 0 {
            self.temp.write(&chunk.part_path, &[]).await?;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if !chunk.ranged && written > 0 {
                self.rewind(chunk, &mut written, sink).await?;
            }
            if chunk.ranged && chunk.expected_len() == Some(written) {
                break;
            }

            let result = match self.limiter.acquire_or_cancel(&self.url, cancel).await {
                Ok(()) => self.fetch_once(chunk, &mut written, sink, cancel).await,
                Err(error) => Err(error),
            };

            match result {
                Ok(()) => break,
                Err(DownloadError::Canceled) => return Err(DownloadError::Canceled),
                Err(error) => match self.retry_policy.decide(&error, attempt, &self.limiter, &self.url) {
                    RetryDecision::Retry { delay, attempt: next } => {
                        debug!(
                            next_attempt = next,
                            delay_ms = delay.as_millis(),
                            written,
                            error = %error,
                            "retrying chunk"
                        );
                        backoff(delay, cancel).await?;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        warn!(attempt, %reason, error = %error, "chunk failed");
                        if let Err(mark_error) = self.chunks.mark_failed(chunk.id).await {
                            warn!(error = %mark_error, "could not mark chunk failed");
                        }
                        return Err(error);
                    }
                },
            }
        }

        self.chunks.mark_done(chunk.id).await?;
        debug!(written, "chunk done");
        Ok(written)
    }

    /// One request for the bytes still missing from the chunk.
    async fn fetch_once(
        &self,
        chunk: &ChunkRecord,
        written: &mut u64,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let range = chunk.range();
        let http_range = chunk
            .ranged
            .then(|| (range.start + *written, range.end.saturating_sub(1)));
        let expected = chunk.expected_len();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::Canceled),
            response = self.client.fetch(&self.url, http_range) => response?,
        };

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::with_capacity(PROGRESS_FLUSH_BYTES);

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    if let Err(error) = self.flush(chunk, &mut buffer, written, sink).await {
                        debug!(error = %error, "flush after cancel failed");
                    }
                    return Err(DownloadError::Canceled);
                }
                next = stream.next() => next,
            };

            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(error)) => {
                    self.flush(chunk, &mut buffer, written, sink).await?;
                    return Err(if error.is_timeout() {
                        DownloadError::timeout(&self.url)
                    } else {
                        DownloadError::network(&self.url, error)
                    });
                }
                None => break,
            };

            let pending = *written + buffer.len() as u64;
            let take = match expected {
                Some(expected) => {
                    let room = expected.saturating_sub(pending);
                    usize::try_from(room).map_or(bytes.len(), |room| room.min(bytes.len()))
                }
                None => bytes.len(),
            };
            buffer.extend_from_slice(&bytes[..take]);

            if buffer.len() >= PROGRESS_FLUSH_BYTES {
                self.flush(chunk, &mut buffer, written, sink).await?;
            }
            if expected.is_some_and(|expected| pending + take as u64 >= expected) {
                break;
            }
        }

        self.flush(chunk, &mut buffer, written, sink).await?;

        match expected {
            Some(expected) if *written < expected => {
                Err(DownloadError::short_body(&self.url, expected, *written))
            }
            _ => Ok(()),
        }
    }

    /// Appends buffered bytes to the part file and records them.
    async fn flush(
        &self,
        chunk: &ChunkRecord,
        buffer: &mut Vec<u8>,
        written: &mut u64,
        sink: &dyn ProgressSink,
    ) -> Result<(), DownloadError> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.temp.append(&chunk.part_path, buffer).await?;
        let len = buffer.len() as u64;
        buffer.clear();

        *written += len;
        self.chunks.add_written(chunk.id, len).await?;
        sink.advance(i64::try_from(len).unwrap_or(i64::MAX)).await;
        Ok(())
    }

    /// Discards a partial unranged body before it is fetched again.
    async fn rewind(
        &self,
        chunk: &ChunkRecord,
        written: &mut u64,
        sink: &dyn ProgressSink,
    ) -> Result<(), DownloadError> {
        debug!(discarded = *written, "restarting unranged chunk from zero");
        sink.advance(-i64::try_from(*written).unwrap_or(i64::MAX)).await;
        self.chunks.reset_written(chunk.id).await?;
        self.temp.write(&chunk.part_path, &[]).await?;
        *written = 0;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    use crate::chunk::{ByteRange, ChunkPlan, ChunkStatus};
    use crate::db::Database;
    use crate::storage::LocalDisk;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use crate::transfer::TransferStore;

    #[derive(Default)]
    struct CountingSink(AtomicI64);

    #[async_trait]
    impl ProgressSink for CountingSink {
        async fn advance(&self, delta: i64) {
            self.0.fetch_add(delta, Ordering::SeqCst);
        }
    }

    struct Fixture {
        chunks: ChunkStore,
        temp: Arc<LocalDisk>,
        _dir: tempfile::TempDir,
        records: Vec<ChunkRecord>,
    }

    async fn fixture(plan: ChunkPlan) -> Fixture {
        let db = Database::new_in_memory().await.unwrap();
        let transfers = TransferStore::new(db.clone());
        let transfer = transfers
            .create(1, "https://a.example/f", "a.example")
            .await
            .unwrap();
        let chunks = ChunkStore::new(db);
        let records = chunks.create_plan(transfer.id, "batch", &plan).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        Fixture {
            chunks,
            temp: Arc::new(LocalDisk::new(dir.path())),
            _dir: dir,
            records,
        }
    }

    fn worker(fx: &Fixture, url: String, retry_budget: u32) -> ChunkFetchWorker {
        ChunkFetchWorker::new(
            HttpClient::with_default_timeouts().unwrap(),
            Arc::new(RateLimiter::disabled()),
            RetryPolicy::new(retry_budget, Duration::from_millis(1), Duration::from_millis(5)),
            fx.chunks.clone(),
            fx.temp.clone(),
            url,
        )
    }

    #[tokio::test]
    async fn test_ranged_chunk_is_written_to_part_file() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/f"))
            .and(header("range", "bytes=4-7"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"4567".to_vec()))
            .mount(&server)
            .await;

        let fx = fixture(ChunkPlan::ranged(
            12,
            vec![ByteRange::new(0, 4), ByteRange::new(4, 8), ByteRange::new(8, 12)],
        ))
        .await;
        let sink = CountingSink::default();
        let chunk = &fx.records[1];

        let written = worker(&fx, format!("{}/f", server.uri()), 0)
            .run(chunk, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 4);
        assert_eq!(sink.0.load(Ordering::SeqCst), 4);
        assert_eq!(fx.temp.read(&chunk.part_path).await.unwrap(), b"4567");
        let stored = fx.chunks.get(chunk.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), ChunkStatus::Done);
        assert_eq!(stored.bytes_written, 4);
    }

    #[tokio::test]
    async fn test_bytes_beyond_range_are_discarded() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"abcdefgh".to_vec()))
            .mount(&server)
            .await;

        let fx = fixture(ChunkPlan::ranged(4, vec![ByteRange::new(0, 4)])).await;
        let sink = CountingSink::default();
        let chunk = &fx.records[0];

        worker(&fx, format!("{}/f", server.uri()), 0)
            .run(chunk, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fx.temp.read(&chunk.part_path).await.unwrap(), b"abcd");
        assert_eq!(sink.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rate_limited_chunk_succeeds_within_budget() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"data".to_vec()))
            .mount(&server)
            .await;

        let fx = fixture(ChunkPlan::ranged(4, vec![ByteRange::new(0, 4)])).await;
        let sink = CountingSink::default();
        let written = worker(&fx, format!("{}/f", server.uri()), 3)
            .run(&fx.records[0], &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 4);
    }

    #[tokio::test]
    async fn test_exhausted_budget_marks_chunk_failed() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let fx = fixture(ChunkPlan::ranged(4, vec![ByteRange::new(0, 4)])).await;
        let sink = CountingSink::default();
        let result = worker(&fx, format!("{}/f", server.uri()), 2)
            .run(&fx.records[0], &sink, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DownloadError::HttpStatus { status: 429, .. })));
        let stored = fx.chunks.get(fx.records[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status(), ChunkStatus::Failed);
    }

    #[tokio::test]
    async fn test_ignored_range_is_not_retried() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"whole".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(ChunkPlan::ranged(5, vec![ByteRange::new(0, 5)])).await;
        let result = worker(&fx, format!("{}/f", server.uri()), 3)
            .run(&fx.records[0], &CountingSink::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DownloadError::RangeIgnored { .. })));
    }

    #[tokio::test]
    async fn test_unranged_chunk_of_unknown_length() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 1000]))
            .mount(&server)
            .await;

        let fx = fixture(ChunkPlan::whole(None)).await;
        let sink = CountingSink::default();
        let written = worker(&fx, format!("{}/f", server.uri()), 0)
            .run(&fx.records[0], &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 1000);
        assert_eq!(fx.temp.size(&fx.records[0].part_path).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_canceled_worker_stops_without_failing_chunk() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let fx = fixture(ChunkPlan::ranged(4, vec![ByteRange::new(0, 4)])).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = worker(&fx, format!("{}/f", server.uri()), 3)
            .run(&fx.records[0], &CountingSink::default(), &cancel)
            .await;
        assert!(matches!(result, Err(DownloadError::Canceled)));
        let stored = fx.chunks.get(fx.records[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status(), ChunkStatus::InFlight);
    }
}
