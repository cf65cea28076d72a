//! Network side of a transfer: probing, pacing, retrying, fetching chunks and
//! assembling them.
//!
//! # Features
//!
//! - Range probes (`Range: bytes=0-0`) to size an asset and detect range support
//! - Per-domain request pacing with `Retry-After` honoured across the domain
//! - Retry budget with exponential backoff and jitter
//! - Streaming chunk fetches into temp part files, flushed every 64 KiB
//! - Ordered, streamed assembly into a per-batch staging file with size
//!   verification, then a rename onto the asset key
//!
//! # Example
//!
//! ```no_run
//! use transfer_core::download::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::with_default_timeouts()?;
//! let probe = client.probe("https://example.com/video.mp4").await?;
//! println!("ranged: {}, size: {:?}", probe.range_capable, probe.total);
//! # Ok(())
//! # }
//! ```

mod assembler;
mod client;
pub mod constants;
mod error;
mod filename;
pub mod rate_limiter;
mod retry;
mod worker;

pub use assembler::{Assembler, STAGING_ROOT, parse_staging_name, staging_key};
pub use client::{HttpClient, ProbeResult, default_user_agent};
pub use error::DownloadError;
pub use filename::{asset_file_name, asset_key};
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{FailureType, RetryDecision, RetryPolicy, backoff, classify_error};
pub use worker::{ChunkFetchWorker, ProgressSink};

// Note: we do NOT define module-local Result aliases here.
// Use `Result<T, DownloadError>` explicitly in function signatures.
