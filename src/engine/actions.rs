//! Commands from the controller layer: pause, resume, cancel, restart,
//! destroy.
//!
//! Each command runs under the transfer's lock, validates the current status
//! against [`TransferAction::permits`], applies a compare-and-set transition
//! and only then cleans up. Cleanup failures are logged and never undo the
//! transition; temp directories of a canceled batch are removed once the
//! batch reports it has stopped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{BatchHandle, EngineInner, TransferEngine};
use crate::catalog::CatalogError;
use crate::chunk::batch_temp_dir;
use crate::transfer::{StoreError, TransferAction, TransferRecord, TransferStatus};

/// Longest wait for a canceled batch to stop before its temp files are
/// deleted anyway.
const CLEANUP_GRACE: Duration = Duration::from_secs(30);

/// Command failures.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The command is not valid in the transfer's current status.
    #[error("cannot {action} transfer {id} while it is {status}")]
    Conflict {
        id: i64,
        status: TransferStatus,
        action: TransferAction,
    },

    #[error("transfer not found: id {0}")]
    NotFound(i64),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl From<StoreError> for ActionError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::TransferNotFound(id) => Self::NotFound(id),
            error => Self::Store(error),
        }
    }
}

impl ActionError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// HTTP status a controller should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Conflict { .. } => 409,
            Self::NotFound(_) => 404,
            Self::Store(_) | Self::Catalog(_) => 500,
        }
    }
}

impl TransferEngine {
    /// Pauses an active transfer. Progress counters are kept until resume;
    /// chunks and part files are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Conflict`] unless the transfer is pending,
    /// queued, preparing or downloading.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: i64) -> Result<TransferRecord, ActionError> {
        let inner = &self.inner;
        let guard = inner.transfer_locks.lock(id).await;
        let record = inner.require_permitted(id, TransferAction::Pause).await?;

        if !inner.transfers.mark_paused(id).await? {
            return Err(inner.conflict(id, TransferAction::Pause).await);
        }
        let handle = inner.detach_batch(id);
        inner.discard_chunks(id, handle).await;
        inner.reset_asset_progress(record.asset_id).await;
        inner.events.status_changed(id, TransferStatus::Paused);
        let paused = inner.transfers.require(id).await?;
        drop(guard);

        info!(from = %record.status(), "paused transfer");
        if record.status().holds_slot() {
            inner.request_pump(&record.domain);
        }
        Ok(paused)
    }

    /// Resumes a paused transfer with a fresh plan.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Conflict`] unless the transfer is paused (or
    /// already pending, which only re-triggers admission).
    #[instrument(skip(self))]
    pub async fn resume(&self, id: i64) -> Result<TransferRecord, ActionError> {
        self.reset_and_readmit(id, TransferAction::Resume).await
    }

    /// Restarts a failed or canceled transfer from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Conflict`] unless the transfer is failed,
    /// canceled or already pending.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: i64) -> Result<TransferRecord, ActionError> {
        self.reset_and_readmit(id, TransferAction::Restart).await
    }

    /// Cancels a transfer for good (until restarted).
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Conflict`] for completed, failed or already
    /// canceled transfers.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64) -> Result<TransferRecord, ActionError> {
        let inner = &self.inner;
        let guard = inner.transfer_locks.lock(id).await;
        let record = inner.require_permitted(id, TransferAction::Cancel).await?;

        inner.cancel_locked(&record).await?;
        let canceled = inner.transfers.require(id).await?;
        drop(guard);

        if record.status().holds_slot() {
            inner.request_pump(&record.domain);
        }
        Ok(canceled)
    }

    /// Cancels the transfer if needed, then deletes it and its chunks.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] for an unknown transfer.
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: i64) -> Result<(), ActionError> {
        self.destroy_inner(id, false).await
    }

    /// As [`TransferEngine::destroy`], and also deletes the asset's stored
    /// file and thumbnail and clears its download fields.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] for an unknown transfer or
    /// [`ActionError::Catalog`] if the asset cannot be updated.
    #[instrument(skip(self))]
    pub async fn destroy_with_asset(&self, id: i64) -> Result<(), ActionError> {
        self.destroy_inner(id, true).await
    }

    async fn reset_and_readmit(
        &self,
        id: i64,
        action: TransferAction,
    ) -> Result<TransferRecord, ActionError> {
        let inner = &self.inner;
        let guard = inner.transfer_locks.lock(id).await;
        let record = inner.require_permitted(id, action).await?;

        if record.status() == TransferStatus::Pending {
            drop(guard);
            debug!(%action, "already pending, re-triggering admission");
            inner.request_pump(&record.domain);
            return Ok(record);
        }

        let handle = inner.detach_batch(id);
        inner.discard_chunks(id, handle).await;
        if !inner.transfers.reset(id).await? {
            return Err(inner.conflict(id, action).await);
        }
        inner.reset_asset_progress(record.asset_id).await;
        inner.events.status_changed(id, TransferStatus::Pending);
        let reset = inner.transfers.require(id).await?;
        drop(guard);

        info!(%action, from = %record.status(), "transfer reset to pending");
        inner.request_pump(&record.domain);
        Ok(reset)
    }

    async fn destroy_inner(&self, id: i64, with_asset: bool) -> Result<(), ActionError> {
        let inner = &self.inner;
        let guard = inner.transfer_locks.lock(id).await;
        let record = inner
            .transfers
            .get(id)
            .await?
            .ok_or(ActionError::NotFound(id))?;
        let status = record.status();

        if TransferAction::Cancel.permits(status) {
            inner.cancel_locked(&record).await?;
        } else {
            let handle = inner.detach_batch(id);
            inner.discard_chunks(id, handle).await;
        }

        inner.transfers.delete(id).await?;

        if with_asset {
            inner.delete_asset_files(record.asset_id).await;
            inner.catalog.clear_download(record.asset_id).await?;
        }
        drop(guard);
        inner.transfer_locks.forget(&id);

        info!(with_asset, from = %status, "destroyed transfer");
        if status.holds_slot() {
            inner.request_pump(&record.domain);
        }
        Ok(())
    }
}

impl EngineInner {
    /// Loads the transfer and checks the command against its status.
    async fn require_permitted(
        &self,
        id: i64,
        action: TransferAction,
    ) -> Result<TransferRecord, ActionError> {
        let record = self.transfers.require(id).await?;
        let status = record.status();
        if !action.permits(status) {
            return Err(ActionError::Conflict { id, status, action });
        }
        Ok(record)
    }

    /// Conflict for a transition that lost its compare-and-set.
    async fn conflict(&self, id: i64, action: TransferAction) -> ActionError {
        match self.transfers.require(id).await {
            Ok(record) => ActionError::Conflict {
                id,
                status: record.status(),
                action,
            },
            Err(error) => error.into(),
        }
    }

    /// Cancel sequence; the caller holds the transfer lock.
    async fn cancel_locked(&self, record: &TransferRecord) -> Result<(), ActionError> {
        let id = record.id;
        if !self.transfers.mark_canceled(id).await? {
            return Err(self.conflict(id, TransferAction::Cancel).await);
        }
        let handle = self.detach_batch(id);
        self.discard_chunks(id, handle).await;
        self.reset_asset_progress(record.asset_id).await;
        self.events.status_changed(id, TransferStatus::Canceled);
        info!(transfer_id = id, from = %record.status(), "canceled transfer");
        Ok(())
    }

    /// Deletes the transfer's chunk records now and its part directories once
    /// the canceled batch (if any) has stopped.
    async fn discard_chunks(&self, transfer_id: i64, handle: Option<BatchHandle>) {
        let mut dirs: BTreeSet<String> = match self.chunks.list(transfer_id).await {
            Ok(chunks) => chunks
                .iter()
                .filter_map(|chunk| chunk.part_path.rsplit_once('/'))
                .map(|(dir, _)| dir.to_string())
                .collect(),
            Err(error) => {
                warn!(transfer_id, error = %error, "could not list chunks for cleanup");
                BTreeSet::new()
            }
        };
        if let Some(handle) = &handle {
            dirs.insert(batch_temp_dir(transfer_id, &handle.batch_id));
        }

        if let Err(error) = self.chunks.delete_for_transfer(transfer_id).await {
            warn!(transfer_id, error = %error, "could not delete chunk records");
        }
        if dirs.is_empty() {
            return;
        }

        let temp = Arc::clone(&self.temp);
        let stopped = handle.map(|handle| handle.stopped);
        self.tasks.spawn(async move {
            if let Some(stopped) = stopped {
                if tokio::time::timeout(CLEANUP_GRACE, stopped.cancelled())
                    .await
                    .is_err()
                {
                    warn!(transfer_id, "batch still running after grace period, deleting parts anyway");
                }
            }
            for dir in dirs {
                match temp.delete_dir(&dir).await {
                    Ok(_) => debug!(transfer_id, dir, "deleted temp parts"),
                    Err(error) => warn!(transfer_id, dir, error = %error, "could not delete temp parts"),
                }
            }
        });
    }

    pub(super) async fn reset_asset_progress(&self, asset_id: i64) {
        if let Err(error) = self.catalog.set_progress(asset_id, 0).await {
            warn!(asset_id, error = %error, "could not reset asset progress");
        }
    }

    /// Best-effort removal of the asset's stored file and thumbnail.
    async fn delete_asset_files(&self, asset_id: i64) {
        let asset = match self.catalog.asset(asset_id).await {
            Ok(asset) => asset,
            Err(error) => {
                warn!(asset_id, error = %error, "could not load asset for file cleanup");
                return;
            }
        };
        for key in [asset.path, asset.thumbnail_path].into_iter().flatten() {
            if let Err(error) = self.permanent.delete(&key).await {
                warn!(asset_id, key, error = %error, "could not delete asset file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_status_codes() {
        let conflict = ActionError::Conflict {
            id: 1,
            status: TransferStatus::Completed,
            action: TransferAction::Cancel,
        };
        assert!(conflict.is_conflict());
        assert_eq!(conflict.status_code(), 409);
        assert_eq!(
            conflict.to_string(),
            "cannot cancel transfer 1 while it is completed"
        );

        let missing = ActionError::from(StoreError::TransferNotFound(9));
        assert!(matches!(missing, ActionError::NotFound(9)));
        assert_eq!(missing.status_code(), 404);
        assert!(!missing.is_conflict());

        let catalog = ActionError::from(CatalogError::MissingAsset(3));
        assert_eq!(catalog.status_code(), 500);
    }
}
