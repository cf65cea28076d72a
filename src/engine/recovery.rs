//! Startup recovery and the temp-disk orphan sweep.

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use super::{EngineError, TransferEngine};
use crate::chunk::{TEMP_ROOT, batch_temp_dir};
use crate::download::{STAGING_ROOT, parse_staging_name};
use crate::transfer::TransferStatus;

/// Outcome of [`TransferEngine::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted transfers reset to pending.
    pub reset: usize,
    /// Orphaned temp directories and staged assemblies removed.
    pub swept: usize,
    /// Transfers admitted by the closing pump.
    pub admitted: usize,
}

impl TransferEngine {
    /// Resets transfers left holding a slot by a previous process, sweeps the
    /// temp disk and pumps every domain with pending work.
    ///
    /// Transfers with a live batch in this process are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the store cannot be queried or
    /// [`EngineError::Storage`] if the temp disk cannot be listed.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let inner = &self.inner;
        let mut reset = 0;

        for record in inner.transfers.list_slot_holders().await? {
            let _guard = inner.transfer_locks.lock(record.id).await;
            if inner.batches.contains_key(&record.id) {
                continue;
            }
            if let Err(error) = inner.chunks.delete_for_transfer(record.id).await {
                warn!(transfer_id = record.id, error = %error, "could not delete stale chunks");
            }
            if inner.transfers.reset(record.id).await? {
                info!(transfer_id = record.id, from = %record.status(), "reset interrupted transfer");
                inner.reset_asset_progress(record.asset_id).await;
                inner.events.status_changed(record.id, TransferStatus::Pending);
                reset += 1;
            }
        }

        let swept = self.sweep_orphans().await?;
        let admitted = inner.pump_all().await?;

        let report = RecoveryReport {
            reset,
            swept,
            admitted,
        };
        info!(?report, "recovery finished");
        Ok(report)
    }

    /// Deletes temp directories no chunk record or live batch refers to, and
    /// staged assemblies on the permanent disk whose batch is not live.
    ///
    /// Directories are listed before the keep-set is read, so a batch that
    /// starts mid-sweep is never mistaken for an orphan. A transfer directory
    /// is removed whole only once its record is gone. Returns the number of
    /// entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if either disk cannot be listed or
    /// [`EngineError::Store`] if chunk records cannot be read.
    #[instrument(skip(self))]
    pub async fn sweep_orphans(&self) -> Result<usize, EngineError> {
        let inner = &self.inner;

        let mut listed = Vec::new();
        for name in inner.temp.list_dir(TEMP_ROOT).await? {
            let dir = format!("{TEMP_ROOT}/{name}");
            let batches = inner.temp.list_dir(&dir).await?;
            listed.push((name, dir, batches));
        }
        let staged = inner.permanent.list_dir(STAGING_ROOT).await?;

        let mut keep: HashSet<String> = inner
            .chunks
            .all_part_paths()
            .await?
            .into_iter()
            .filter_map(|path| path.rsplit_once('/').map(|(dir, _)| dir.to_string()))
            .collect();
        keep.extend(
            inner
                .batches
                .iter()
                .map(|entry| batch_temp_dir(*entry.key(), &entry.value().batch_id)),
        );

        let mut swept = 0;
        for (name, dir, batches) in listed {
            let transfer_gone = match name.parse::<i64>() {
                Ok(id) => inner.transfers.get(id).await?.is_none(),
                Err(_) => true,
            };
            let prefix = format!("{dir}/");
            if transfer_gone && !keep.iter().any(|kept| kept.starts_with(&prefix)) {
                swept += usize::from(remove_dir(self, &dir).await);
                continue;
            }

            for batch in batches {
                let batch_dir = format!("{dir}/{batch}");
                if !keep.contains(&batch_dir) {
                    swept += usize::from(remove_dir(self, &batch_dir).await);
                }
            }
        }

        for name in staged {
            let live = parse_staging_name(&name).is_some_and(|(transfer_id, batch_id)| {
                inner
                    .batches
                    .get(&transfer_id)
                    .is_some_and(|live| live.batch_id == batch_id)
            });
            if live {
                continue;
            }
            let key = format!("{STAGING_ROOT}/{name}");
            match inner.permanent.delete(&key).await {
                Ok(removed) => swept += usize::from(removed),
                Err(error) => warn!(key = %key, error = %error, "could not sweep staged asset"),
            }
        }

        if swept > 0 {
            info!(swept, "removed orphaned temp files");
        }
        Ok(swept)
    }
}

async fn remove_dir(engine: &TransferEngine, dir: &str) -> bool {
    match engine.inner.temp.delete_dir(dir).await {
        Ok(removed) => {
            debug!(dir, removed, "swept temp directory");
            removed
        }
        Err(error) => {
            warn!(dir, error = %error, "could not sweep temp directory");
            false
        }
    }
}
