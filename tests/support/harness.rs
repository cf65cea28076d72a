//! Engine wired to a file database and temp directories.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use transfer_core::{
    AssetCatalog, Database, EngineConfig, LocalDisk, ObjectStorage, SqliteCatalog,
    TransferEngine, TransferRecord, TransferStatus,
};

const WAIT_LIMIT: Duration = Duration::from_secs(30);

#[allow(dead_code)]
pub struct Harness {
    pub engine: TransferEngine,
    pub db: Database,
    pub catalog: Arc<SqliteCatalog>,
    pub temp: Arc<LocalDisk>,
    pub permanent: Arc<LocalDisk>,
    _dir: TempDir,
}

/// Small chunks, no pacing, millisecond backoff.
#[allow(dead_code)]
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        chunk_size: 2_000_000,
        rate_limit_requests: 0,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..EngineConfig::default()
    }
}

#[allow(dead_code)]
impl Harness {
    pub async fn new(config: EngineConfig) -> Self {
        Self::with_permanent(config, |disk| disk as Arc<dyn ObjectStorage>).await
    }

    /// Like [`Harness::new`], with the engine's permanent disk wrapped by
    /// `wrap`. `permanent` still points at the unwrapped disk.
    pub async fn with_permanent(
        config: EngineConfig,
        wrap: impl FnOnce(Arc<LocalDisk>) -> Arc<dyn ObjectStorage>,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("transfers.db"))
            .await
            .expect("database");
        let catalog = Arc::new(SqliteCatalog::new(db.clone()));
        let temp = Arc::new(LocalDisk::new(dir.path().join("tmp")));
        let permanent = Arc::new(LocalDisk::new(dir.path().join("store")));
        let engine = TransferEngine::new(
            config,
            db.clone(),
            catalog.clone(),
            temp.clone(),
            wrap(permanent.clone()),
        )
        .expect("engine");
        Self {
            engine,
            db,
            catalog,
            temp,
            permanent,
            _dir: dir,
        }
    }

    /// Registers `url` as an asset and enqueues it.
    pub async fn enqueue(&self, url: &str) -> TransferRecord {
        let asset = self.catalog.insert_asset(url).await.expect("asset");
        self.engine.enqueue(asset.id).await.expect("enqueue")
    }

    pub async fn record(&self, id: i64) -> TransferRecord {
        self.engine
            .get(id)
            .await
            .expect("get")
            .expect("transfer exists")
    }

    pub async fn wait_for_status(&self, id: i64, status: TransferStatus) -> TransferRecord {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let record = self.record(id).await;
                if record.status() == status {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("transfer {id} never reached {status}"))
    }

    /// Waits for completion and for the batch to finish its bookkeeping.
    pub async fn completed(&self, id: i64) -> TransferRecord {
        self.wait_for_status(id, TransferStatus::Completed).await;
        self.wait_idle().await;
        self.record(id).await
    }

    /// Waits until nothing is left under the transfer's temp directory.
    pub async fn temp_cleared(&self, id: i64) {
        let dir = format!("transfers/{id}");
        tokio::time::timeout(WAIT_LIMIT, async {
            while !self.temp.list_dir(&dir).await.expect("list temp").is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("temp parts of transfer {id} were never removed"));
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(WAIT_LIMIT, self.engine.wait_idle())
            .await
            .expect("engine should go idle")
            .expect("idle check");
    }

    /// Bytes of the asset's stored file.
    pub async fn stored_file(&self, asset_id: i64) -> Vec<u8> {
        let asset = self.catalog.asset(asset_id).await.expect("asset");
        let key = asset.path.expect("asset has a stored path");
        self.permanent.read(&key).await.expect("stored file")
    }
}
