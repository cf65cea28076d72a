//! Per-domain request pacing.
//!
//! [`RateLimiter`] keeps a rolling window of request start times per domain
//! and admits a request only while the window holds fewer than the configured
//! quota. A `Retry-After` from any response blocks the whole domain, even
//! when window pacing is off.
//!
//! ```
//! use std::time::Duration;
//! use transfer_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(2, Duration::from_secs(1));
//! limiter.acquire("https://example.com/a.jpg").await;
//! limiter.acquire("https://example.com/b.jpg").await;
//! // Waits until the first request leaves the window.
//! limiter.acquire("https://example.com/c.jpg").await;
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::DownloadError;
use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Rolling-window pacer shared by every chunk worker.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    disabled: bool,
    /// Entries are `Arc`ed so no shard lock is held across an await.
    domains: DashMap<String, Arc<DomainState>>,
}

#[derive(Debug)]
struct DomainState {
    /// Start instants inside the current window, oldest first.
    recent: Mutex<VecDeque<Instant>>,
    blocked_until: std::sync::Mutex<Option<Instant>>,
    /// Total pacing delay in milliseconds, for the excess warning.
    waited_ms: AtomicU64,
}

impl DomainState {
    fn new() -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            blocked_until: std::sync::Mutex::new(None),
            waited_ms: AtomicU64::new(0),
        }
    }

    fn blocked_until(&self) -> Option<Instant> {
        *self
            .blocked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn block_until(&self, until: Instant) {
        let mut guard = self
            .blocked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none_or(|current| current < until) {
            *guard = Some(until);
        }
    }

    fn add_waited(&self, delay: Duration) -> Duration {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let total = self
            .waited_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            .saturating_add(delay_ms);
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per `window` per domain.
    ///
    /// A `max_requests` of zero yields a disabled limiter.
    #[must_use]
    #[instrument(skip_all, fields(max_requests, window_ms = window.as_millis()))]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        if max_requests == 0 || window.is_zero() {
            return Self::disabled();
        }
        debug!("creating rate limiter");
        Self {
            max_requests: usize::try_from(max_requests).unwrap_or(usize::MAX),
            window,
            disabled: false,
            domains: DashMap::new(),
        }
    }

    /// Creates a disabled rate limiter that applies no delays.
    ///
    /// `Retry-After` blocks are still honoured.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_requests: usize::MAX,
            window: Duration::ZERO,
            disabled: true,
            domains: DashMap::new(),
        }
    }

    /// Returns whether window pacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    fn state(&self, domain: &str) -> Arc<DomainState> {
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainState::new()))
            .clone()
    }

    /// Waits until a request to the URL's domain is admitted, then records it.
    #[instrument(skip(self), fields(domain))]
    pub async fn acquire(&self, url: &str) {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", &domain);
        let state = self.state(&domain);

        // Held across sleeps: waiters are admitted in arrival order.
        let mut recent = state.recent.lock().await;

        loop {
            let now = Instant::now();

            if let Some(until) = state.blocked_until()
                && until > now
            {
                let delay = until - now;
                Self::note_delay(&state, &domain, delay, "retry-after");
                tokio::time::sleep(delay).await;
                continue;
            }

            if self.disabled {
                return;
            }

            while recent
                .front()
                .is_some_and(|started| now.duration_since(*started) >= self.window)
            {
                recent.pop_front();
            }

            if recent.len() < self.max_requests {
                recent.push_back(now);
                return;
            }

            let Some(oldest) = recent.front().copied() else {
                continue;
            };
            let delay = self.window.saturating_sub(now.duration_since(oldest));
            Self::note_delay(&state, &domain, delay, "window");
            tokio::time::sleep(delay).await;
        }
    }

    /// [`RateLimiter::acquire`] raced against a cancellation token.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Canceled`] if the token fires first.
    pub async fn acquire_or_cancel(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        tokio::select! {
            () = cancel.cancelled() => Err(DownloadError::Canceled),
            () = self.acquire(url) => Ok(()),
        }
    }

    fn note_delay(state: &DomainState, domain: &str, delay: Duration, reason: &'static str) {
        let waited = state.add_waited(delay);
        debug!(%domain, delay_ms = delay.as_millis(), waited_ms = waited.as_millis(), reason, "pacing domain");
        if waited >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(%domain, waited_secs = waited.as_secs(), reason, "domain heavily paced");
        }
    }

    /// Records a server-mandated delay (from a Retry-After header).
    ///
    /// Every request to the domain is held back until the delay has elapsed.
    #[instrument(skip(self), fields(domain))]
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", &domain);

        let state = self.state(&domain);
        state.block_until(Instant::now() + delay);
        Self::note_delay(&state, &domain, delay, "server");
    }
}

/// Lowercased host of `url`, or `"unknown"` when it has none.
///
/// Unparseable URLs share the `"unknown"` bucket so they are still paced.
///
/// ```
/// use transfer_core::download::extract_domain;
///
/// assert_eq!(extract_domain("http://CDN.Example.com:8080/a.jpg"), "cdn.example.com");
/// assert_eq!(extract_domain("::"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed
            .host_str()
            .map_or_else(|| UNKNOWN_DOMAIN.to_string(), str::to_ascii_lowercase),
        Err(_) => UNKNOWN_DOMAIN.to_string(),
    }
}

const UNKNOWN_DOMAIN: &str = "unknown";

/// Delay requested by a `Retry-After` value, in delta-seconds or HTTP-date
/// form, capped at [`MAX_RETRY_AFTER`]. A date in the past means no delay.
///
/// ```
/// use std::time::Duration;
/// use transfer_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
/// assert_eq!(parse_retry_after("later"), None);
/// ```
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let requested = if value.bytes().all(|b| b.is_ascii_digit()) && !value.is_empty() {
        Duration::from_secs(value.parse().ok()?)
    } else if let Ok(at) = httpdate::parse_http_date(value) {
        at.duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO)
    } else {
        debug!(value, "ignoring unparseable Retry-After");
        return None;
    };

    if requested > MAX_RETRY_AFTER {
        warn!(
            requested_secs = requested.as_secs(),
            "Retry-After above the cap, clamping"
        );
        return Some(MAX_RETRY_AFTER);
    }
    Some(requested)
}
