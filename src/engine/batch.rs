//! One job-batch: plan, fetch every chunk, assemble, complete.
//!
//! A batch owns the transfer only while the record still carries its batch
//! id. Every transition is a compare-and-set on that id, so a batch that lost
//! a race with a command (pause, cancel, restart) simply stops.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::{BatchHandle, EngineInner};
use crate::chunk::{ChunkRecord, batch_temp_dir};
use crate::download::{
    ChunkFetchWorker, DownloadError, ProgressSink, asset_file_name, asset_key, staging_key,
};
use crate::events::TransferEvent;
use crate::transfer::{TransferRecord, TransferStatus, percent_of};

/// Why a batch stopped before completing its transfer.
#[derive(Debug)]
enum BatchEnd {
    /// Canceled by a command or shutdown, or superseded by a newer batch.
    Stopped,
    Failed(String),
}

impl From<DownloadError> for BatchEnd {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::Canceled => Self::Stopped,
            error => Self::Failed(error.to_string()),
        }
    }
}

/// Runs the batch to its end, then frees its slot by pumping the domain.
#[instrument(skip_all, fields(transfer_id = record.id, batch_id = %handle.batch_id))]
pub(crate) async fn run(inner: Arc<EngineInner>, record: TransferRecord, handle: BatchHandle) {
    let transfer_id = record.id;

    match drive(&inner, &record, &handle).await {
        Ok(()) => {}
        Err(BatchEnd::Stopped) => debug!("batch stopped"),
        Err(BatchEnd::Failed(error)) => fail(&inner, transfer_id, &handle.batch_id, &error).await,
    }

    handle.stopped.cancel();
    inner
        .batches
        .remove_if(&transfer_id, |_, live| live.batch_id == handle.batch_id);
    inner.batch_ended.notify_waiters();

    if let Err(error) = inner.pump(record.domain.clone()).await {
        warn!(domain = %record.domain, error = %error, "pump after batch failed");
    }
}

async fn drive(
    inner: &Arc<EngineInner>,
    record: &TransferRecord,
    handle: &BatchHandle,
) -> Result<(), BatchEnd> {
    let id = record.id;
    let batch_id = handle.batch_id.as_str();

    {
        let _guard = inner.transfer_locks.lock(id).await;
        if !store(inner.transfers.mark_preparing(id, batch_id).await)? {
            return Err(BatchEnd::Stopped);
        }
        inner.events.status_changed(id, TransferStatus::Preparing);
    }

    let plan = inner.planner.plan(&record.source_url, &handle.token).await?;

    let chunks = {
        let _guard = inner.transfer_locks.lock(id).await;
        if !store(inner.transfers.mark_downloading(id, batch_id, plan.bytes_total).await)? {
            return Err(BatchEnd::Stopped);
        }
        let chunks = store(inner.chunks.create_plan(id, batch_id, &plan).await)?;
        inner.events.status_changed(id, TransferStatus::Downloading);
        chunks
    };
    info!(chunks = chunks.len(), bytes_total = ?plan.bytes_total, "downloading");

    fetch_all(inner, record, handle, &chunks).await?;

    {
        let _guard = inner.transfer_locks.lock(id).await;
        if !store(inner.transfers.mark_assembling(id, batch_id).await)? {
            return Err(BatchEnd::Stopped);
        }
        inner.events.status_changed(id, TransferStatus::Assembling);
    }

    let chunks = store(inner.chunks.list(id).await)?;
    let staging = staging_key(id, batch_id);
    let size = inner
        .assembler
        .assemble(&chunks, plan.bytes_total, &staging, &handle.token)
        .await?;

    complete(inner, record, handle, &chunks, &staging, size).await
}

/// Runs one worker per chunk on the shared pool. The first failure cancels
/// the rest.
async fn fetch_all(
    inner: &Arc<EngineInner>,
    record: &TransferRecord,
    handle: &BatchHandle,
    chunks: &[ChunkRecord],
) -> Result<(), BatchEnd> {
    let worker = ChunkFetchWorker::new(
        inner.client.clone(),
        Arc::clone(&inner.limiter),
        inner.retry_policy.clone(),
        inner.chunks.clone(),
        Arc::clone(&inner.temp),
        record.source_url.clone(),
    );
    let sink: Arc<dyn ProgressSink> = Arc::new(BatchProgress {
        inner: Arc::clone(inner),
        transfer_id: record.id,
        asset_id: record.asset_id,
        batch_id: handle.batch_id.clone(),
    });

    let mut set = JoinSet::new();
    for chunk in chunks.iter().cloned() {
        let worker = worker.clone();
        let sink = Arc::clone(&sink);
        let token = handle.token.clone();
        let pool = Arc::clone(&inner.workers);
        set.spawn(async move {
            let _permit = tokio::select! {
                () = token.cancelled() => return Err(DownloadError::Canceled),
                permit = pool.acquire_owned() => permit.map_err(|_| DownloadError::Canceled)?,
            };
            worker.run(&chunk, sink.as_ref(), &token).await
        });
    }

    let mut failure: Option<String> = None;
    while let Some(joined) = set.join_next().await {
        let error = match joined {
            Ok(Ok(_)) | Ok(Err(DownloadError::Canceled)) => continue,
            Ok(Err(error)) => error.to_string(),
            Err(join_error) => format!("chunk worker panicked: {join_error}"),
        };
        if failure.is_none() {
            warn!(error = %error, "chunk failed, canceling batch");
            handle.token.cancel();
            failure = Some(error);
        }
    }

    match failure {
        Some(error) => Err(BatchEnd::Failed(error)),
        None if handle.token.is_cancelled() => Err(BatchEnd::Stopped),
        None => Ok(()),
    }
}

/// Promotes the staged file and completes the transfer, both under the
/// transfer lock so no command can slip between them.
async fn complete(
    inner: &Arc<EngineInner>,
    record: &TransferRecord,
    handle: &BatchHandle,
    chunks: &[ChunkRecord],
    staging: &str,
    size: u64,
) -> Result<(), BatchEnd> {
    let id = record.id;
    let file_name = asset_file_name(&record.source_url, record.asset_id);
    let dest_key = asset_key(record.asset_id, &file_name);
    let _guard = inner.transfer_locks.lock(id).await;

    let current = store(inner.transfers.get(id).await)?;
    let owned = current.is_some_and(|current| {
        current.status() == TransferStatus::Assembling
            && current.batch_id.as_deref() == Some(handle.batch_id.as_str())
    });
    if !owned || handle.token.is_cancelled() {
        inner.assembler.discard(staging).await;
        return Err(BatchEnd::Stopped);
    }

    inner.assembler.promote(staging, &dest_key).await?;

    if !store(inner.transfers.mark_completed(id, &handle.batch_id, size).await)? {
        warn!(dest = %dest_key, "transfer changed hands after its asset was promoted");
        return Err(BatchEnd::Stopped);
    }

    if let Err(error) = inner
        .catalog
        .mark_downloaded(record.asset_id, &dest_key, size)
        .await
    {
        warn!(asset_id = record.asset_id, error = %error, "could not record download on asset");
    }

    for chunk in chunks {
        if let Err(error) = inner.chunks.delete(chunk.id).await {
            warn!(chunk_id = chunk.id, error = %error, "could not delete chunk record");
        }
    }
    let temp_dir = batch_temp_dir(id, &handle.batch_id);
    if let Err(error) = inner.temp.delete_dir(&temp_dir).await {
        warn!(dir = temp_dir, error = %error, "could not delete temp parts");
    }

    inner.events.status_changed(id, TransferStatus::Completed);
    info!(size, dest = %dest_key, "transfer completed");
    Ok(())
}

/// Records the failure if this batch still owns the transfer. Chunks and part
/// files stay for diagnosis until the next restart or destroy.
async fn fail(inner: &Arc<EngineInner>, transfer_id: i64, batch_id: &str, error: &str) {
    let _guard = inner.transfer_locks.lock(transfer_id).await;
    match inner.transfers.mark_failed(transfer_id, batch_id, error).await {
        Ok(true) => {
            warn!(transfer_id, error, "transfer failed");
            inner.events.status_changed(transfer_id, TransferStatus::Failed);
        }
        Ok(false) => debug!(transfer_id, "failure ignored, batch superseded"),
        Err(store_error) => {
            warn!(transfer_id, error = %store_error, "could not record transfer failure");
        }
    }
}

fn store<T>(result: Result<T, crate::transfer::StoreError>) -> Result<T, BatchEnd> {
    result.map_err(|error| BatchEnd::Failed(error.to_string()))
}

/// Folds worker deltas into the transfer and mirrors whole-percent changes.
struct BatchProgress {
    inner: Arc<EngineInner>,
    transfer_id: i64,
    asset_id: i64,
    batch_id: String,
}

#[async_trait]
impl ProgressSink for BatchProgress {
    async fn advance(&self, delta: i64) {
        let snapshot = match self
            .inner
            .transfers
            .add_downloaded(self.transfer_id, &self.batch_id, delta)
            .await
        {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(error) => {
                warn!(transfer_id = self.transfer_id, error = %error, "could not record progress");
                return;
            }
        };

        let Some(total) = snapshot.bytes_total else {
            return;
        };
        let percent = percent_of(snapshot.bytes_downloaded, total);
        if snapshot.last_broadcast_percent == Some(percent) {
            return;
        }

        match self
            .inner
            .transfers
            .set_broadcast_percent(self.transfer_id, &self.batch_id, percent)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                warn!(transfer_id = self.transfer_id, error = %error, "could not record broadcast percent");
                return;
            }
        }

        self.inner.events.publish(TransferEvent::Progress {
            transfer_id: self.transfer_id,
            asset_id: self.asset_id,
            percent,
            bytes_downloaded: snapshot.bytes_downloaded,
            bytes_total: Some(total),
        });
        if let Err(error) = self.inner.catalog.set_progress(self.asset_id, percent).await {
            warn!(asset_id = self.asset_id, error = %error, "could not mirror progress");
        }
    }
}
