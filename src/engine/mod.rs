//! The transfer engine: admission, job-batches, commands and recovery.
//!
//! # Overview
//!
//! [`TransferEngine`] is a cheap-to-clone handle over shared state. New
//! transfers enter `pending`; the per-domain pump admits them up to the
//! domain's ceiling and spawns one job-batch per admitted transfer. A batch
//! plans chunks, runs one [`ChunkFetchWorker`](crate::download::ChunkFetchWorker)
//! per chunk on a shared worker pool, assembles the parts and completes the
//! transfer. Commands ([`TransferEngine::pause`] and friends) cancel the live
//! batch and reset or retire the record.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use transfer_core::{Database, EngineConfig, LocalDisk, SqliteCatalog, TransferEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let catalog = SqliteCatalog::new(db.clone());
//! let asset = catalog.insert_asset("https://example.com/clip.mp4").await?;
//!
//! let engine = TransferEngine::new(
//!     EngineConfig::default(),
//!     db,
//!     Arc::new(catalog),
//!     Arc::new(LocalDisk::new("./tmp")),
//!     Arc::new(LocalDisk::new("./store")),
//! )?;
//! let transfer = engine.enqueue(asset.id).await?;
//! engine.wait_idle().await?;
//! println!("{:?}", engine.get(transfer.id).await?);
//! # Ok(())
//! # }
//! ```

mod actions;
mod batch;
mod locks;
mod recovery;
mod scheduler;

pub use actions::ActionError;
pub use recovery::RecoveryReport;
pub use scheduler::{CeilingResolver, ConfiguredCeilings};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument};
use url::Url;

use crate::catalog::{AssetCatalog, CatalogError};
use crate::chunk::{ChunkPlanner, ChunkRecord, ChunkStore};
use crate::config::{ConfigError, EngineConfig};
use crate::db::Database;
use crate::download::{Assembler, HttpClient, RateLimiter, RetryPolicy};
use crate::events::{EventBus, TransferEvent};
use crate::storage::{ObjectStorage, StorageError};
use crate::transfer::{StoreError, TransferRecord, TransferStatus, TransferStore};

use locks::KeyedLocks;

/// How often [`TransferEngine::wait_idle`] re-checks the store when no batch
/// signals in between.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors from engine construction and ingest.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The asset's source URL has no http(s) host to schedule against.
    #[error("asset {asset_id} has an unschedulable source URL: {url}")]
    InvalidUrl { asset_id: i64, url: String },
}

/// Cancellation handles of one live job-batch.
#[derive(Debug, Clone)]
pub(crate) struct BatchHandle {
    pub(crate) batch_id: String,
    /// Fired to stop the batch's workers.
    pub(crate) token: CancellationToken,
    /// Fired by the batch once every worker has returned.
    pub(crate) stopped: CancellationToken,
}

impl BatchHandle {
    fn new(batch_id: String) -> Self {
        Self {
            batch_id,
            token: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }
}

/// Shared engine state.
#[derive(Debug)]
pub(crate) struct EngineInner {
    config: EngineConfig,
    transfers: TransferStore,
    chunks: ChunkStore,
    catalog: Arc<dyn AssetCatalog>,
    temp: Arc<dyn ObjectStorage>,
    permanent: Arc<dyn ObjectStorage>,
    client: HttpClient,
    limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    planner: ChunkPlanner,
    assembler: Assembler,
    ceilings: Arc<dyn CeilingResolver>,
    events: EventBus,
    workers: Arc<Semaphore>,
    transfer_locks: KeyedLocks<i64>,
    domain_locks: KeyedLocks<String>,
    /// Live batch per transfer id.
    batches: DashMap<i64, BatchHandle>,
    tasks: TaskTracker,
    batch_ended: Notify,
    closed: AtomicBool,
}

impl EngineInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Removes and cancels the transfer's live batch, if any.
    fn detach_batch(&self, transfer_id: i64) -> Option<BatchHandle> {
        self.batches.remove(&transfer_id).map(|(_, handle)| {
            handle.token.cancel();
            handle
        })
    }
}

/// Handle to a running transfer engine.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    /// Creates an engine whose ceilings come from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an invalid configuration or
    /// [`EngineError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(
        config: EngineConfig,
        db: Database,
        catalog: Arc<dyn AssetCatalog>,
        temp: Arc<dyn ObjectStorage>,
        permanent: Arc<dyn ObjectStorage>,
    ) -> Result<Self, EngineError> {
        let ceilings = Arc::new(ConfiguredCeilings::new(
            config.domain_concurrency,
            config.domain_overrides.clone(),
        ));
        Self::with_ceiling_resolver(config, db, catalog, temp, permanent, ceilings)
    }

    /// Creates an engine with an injected ceiling resolver.
    ///
    /// # Errors
    ///
    /// As [`TransferEngine::new`].
    pub fn with_ceiling_resolver(
        config: EngineConfig,
        db: Database,
        catalog: Arc<dyn AssetCatalog>,
        temp: Arc<dyn ObjectStorage>,
        permanent: Arc<dyn ObjectStorage>,
        ceilings: Arc<dyn CeilingResolver>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let client = HttpClient::new(
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.read_timeout_secs),
        )?;
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_window(),
        ));
        let retry_policy = RetryPolicy::new(
            config.retry_budget,
            config.retry_base_delay(),
            config.retry_max_delay(),
        );
        let planner = ChunkPlanner::new(
            client.clone(),
            Arc::clone(&limiter),
            retry_policy.clone(),
            config.chunk_size,
            config.max_chunks,
        );
        let assembler = Assembler::new(Arc::clone(&temp), Arc::clone(&permanent));

        info!(
            worker_pool_size = config.worker_pool_size,
            domain_concurrency = config.domain_concurrency,
            retry_budget = config.retry_budget,
            "transfer engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                workers: Arc::new(Semaphore::new(config.worker_pool_size)),
                transfers: TransferStore::new(db.clone()),
                chunks: ChunkStore::new(db),
                catalog,
                temp,
                permanent,
                client,
                limiter,
                retry_policy,
                planner,
                assembler,
                ceilings,
                events: EventBus::new(),
                transfer_locks: KeyedLocks::new(),
                domain_locks: KeyedLocks::new(),
                batches: DashMap::new(),
                tasks: TaskTracker::new(),
                batch_ended: Notify::new(),
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Receiver for progress and status events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Creates a pending transfer for a catalog asset and requests admission.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Catalog`] for an unknown asset,
    /// [`EngineError::InvalidUrl`] when its URL has no http(s) host, or
    /// [`EngineError::Store`] if the insert fails.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, asset_id: i64) -> Result<TransferRecord, EngineError> {
        let asset = self.inner.catalog.asset(asset_id).await?;
        let domain = schedulable_domain(&asset.source_url).ok_or_else(|| EngineError::InvalidUrl {
            asset_id,
            url: asset.source_url.clone(),
        })?;

        let record = self
            .inner
            .transfers
            .create(asset_id, &asset.source_url, &domain)
            .await?;
        info!(transfer_id = record.id, %domain, "enqueued transfer");
        self.inner
            .events
            .status_changed(record.id, TransferStatus::Pending);
        self.inner.request_pump(&domain);
        Ok(record)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the query fails.
    pub async fn get(&self, transfer_id: i64) -> Result<Option<TransferRecord>, EngineError> {
        Ok(self.inner.transfers.get(transfer_id).await?)
    }

    /// All transfers, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the query fails.
    pub async fn list(&self) -> Result<Vec<TransferRecord>, EngineError> {
        Ok(self.inner.transfers.list_all().await?)
    }

    /// The transfer's chunks in range order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the query fails.
    pub async fn chunks(&self, transfer_id: i64) -> Result<Vec<ChunkRecord>, EngineError> {
        Ok(self.inner.chunks.list(transfer_id).await?)
    }

    /// Admits pending transfers for `domain`; returns how many were admitted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if counting or claiming fails.
    pub async fn pump(&self, domain: &str) -> Result<usize, EngineError> {
        Ok(self.inner.pump(domain.to_ascii_lowercase()).await?)
    }

    /// Pumps every domain with pending transfers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if a pump fails.
    pub async fn pump_all(&self) -> Result<usize, EngineError> {
        Ok(self.inner.pump_all().await?)
    }

    /// Drops cached ceilings (for one domain or all) and re-pumps, so a raised
    /// ceiling takes effect at once.
    pub fn invalidate_ceiling(&self, domain: Option<&str>) {
        self.inner.ceilings.invalidate(domain);
        match domain {
            Some(domain) => self.inner.request_pump(&domain.to_ascii_lowercase()),
            None => {
                let inner = Arc::clone(&self.inner);
                self.inner.tasks.spawn(async move {
                    if let Err(error) = inner.pump_all().await {
                        tracing::warn!(error = %error, "pump after invalidation failed");
                    }
                });
            }
        }
    }

    /// Stops the pump from admitting. Ingest and commands keep working and
    /// leave their transfers pending for the next process that runs.
    pub fn suspend_admission(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Waits until no transfer is pending or holding a slot and no batch is
    /// live.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the store cannot be queried.
    pub async fn wait_idle(&self) -> Result<(), EngineError> {
        loop {
            let notified = self.inner.batch_ended.notified();
            if self.is_idle().await? {
                return Ok(());
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
            }
        }
    }

    async fn is_idle(&self) -> Result<bool, EngineError> {
        if !self.inner.batches.is_empty() {
            return Ok(false);
        }
        let busy = !self.inner.transfers.list_slot_holders().await?.is_empty()
            || !self.inner.transfers.pending_domains().await?.is_empty();
        Ok(!busy)
    }

    /// Stops admitting, cancels live batches and waits for background tasks.
    ///
    /// Canceled transfers keep their slot-holding status and are reset by
    /// [`TransferEngine::recover`] on the next start.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let live: Vec<i64> = self.inner.batches.iter().map(|entry| *entry.key()).collect();
        for transfer_id in live {
            self.inner.detach_batch(transfer_id);
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("transfer engine stopped");
    }
}

/// Lowercased host of an http(s) URL.
fn schedulable_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.host_str().map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedulable_domain() {
        assert_eq!(
            schedulable_domain("https://CDN.Example.com/a.jpg").as_deref(),
            Some("cdn.example.com")
        );
        assert_eq!(
            schedulable_domain("http://127.0.0.1:8080/x").as_deref(),
            Some("127.0.0.1")
        );
        assert_eq!(schedulable_domain("ftp://example.com/a"), None);
        assert_eq!(schedulable_domain("not a url"), None);
    }
}
