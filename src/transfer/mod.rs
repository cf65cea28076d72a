//! Durable transfer records and their state machine.
//!
//! Every status change is a compare-and-set against the current status, and
//! batch-driven changes are additionally pinned to the batch id. A batch that
//! lost a race with a command (pause, cancel) therefore updates zero rows
//! instead of overwriting the command's state.
//!
//! # Example
//!
//! ```ignore
//! use transfer_core::{Database, TransferStore, TransferStatus};
//!
//! let store = TransferStore::new(Database::new_in_memory().await?);
//! let transfer = store.create(7, "https://cdn.example.com/a.jpg", "cdn.example.com").await?;
//! assert_eq!(transfer.status(), TransferStatus::Pending);
//! ```

mod error;
mod record;

pub use error::{DbErrorKind, StoreError};
pub use record::{TransferAction, TransferRecord, TransferStatus, percent_of};

use sqlx::Row;
use tracing::instrument;

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::TransferNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::TransferNotFound(id))
    } else {
        Ok(())
    }
}

/// Renders statuses as a quoted SQL list: `'queued', 'preparing'`.
fn sql_status_list(statuses: &[TransferStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Statuses a pause may interrupt.
const PAUSABLE: [TransferStatus; 4] = [
    TransferStatus::Pending,
    TransferStatus::Queued,
    TransferStatus::Preparing,
    TransferStatus::Downloading,
];

/// Statuses a reset back to pending may start from.
const RESETTABLE: [TransferStatus; 7] = [
    TransferStatus::Paused,
    TransferStatus::Failed,
    TransferStatus::Canceled,
    TransferStatus::Queued,
    TransferStatus::Preparing,
    TransferStatus::Downloading,
    TransferStatus::Assembling,
];

/// Statuses that refuse cancellation.
const UNCANCELABLE: [TransferStatus; 3] = [
    TransferStatus::Completed,
    TransferStatus::Failed,
    TransferStatus::Canceled,
];

/// Progress counters returned by [`TransferStore::add_downloaded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub last_broadcast_percent: Option<u8>,
}

/// SQLite-backed transfer store.
#[derive(Debug, Clone)]
pub struct TransferStore {
    db: Database,
}

impl TransferStore {
    /// Creates a store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new pending transfer, stamping `queued_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self), fields(url = %source_url))]
    pub async fn create(
        &self,
        asset_id: i64,
        source_url: &str,
        domain: &str,
    ) -> Result<TransferRecord> {
        let record = sqlx::query_as::<_, TransferRecord>(
            r"INSERT INTO transfers (asset_id, source_url, domain, status, queued_at)
              VALUES (?, ?, ?, ?, strftime('%Y-%m-%d %H:%M:%f', 'now'))
              RETURNING *",
        )
        .bind(asset_id)
        .bind(source_url)
        .bind(domain)
        .bind(TransferStatus::Pending.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Gets a transfer by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<TransferRecord>> {
        let record = sqlx::query_as::<_, TransferRecord>(r"SELECT * FROM transfers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(record)
    }

    /// Gets a transfer by ID, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TransferNotFound`] for a missing ID.
    pub async fn require(&self, id: i64) -> Result<TransferRecord> {
        self.get(id).await?.ok_or(StoreError::TransferNotFound(id))
    }

    /// Lists every transfer, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<TransferRecord>> {
        let records =
            sqlx::query_as::<_, TransferRecord>(r"SELECT * FROM transfers ORDER BY id ASC")
                .fetch_all(self.db.pool())
                .await?;

        Ok(records)
    }

    /// Lists transfers currently holding an admission slot on any domain.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_slot_holders(&self) -> Result<Vec<TransferRecord>> {
        let sql = format!(
            "SELECT * FROM transfers WHERE status IN ({}) ORDER BY id ASC",
            sql_status_list(&TransferStatus::SLOT_HOLDING)
        );
        let records = sqlx::query_as::<_, TransferRecord>(&sql)
            .fetch_all(self.db.pool())
            .await?;

        Ok(records)
    }

    /// Counts transfers holding an admission slot on `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_slot_holders(&self, domain: &str) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) AS count FROM transfers WHERE domain = ? AND status IN ({})",
            sql_status_list(&TransferStatus::SLOT_HOLDING)
        );
        let row = sqlx::query(&sql)
            .bind(domain)
            .fetch_one(self.db.pool())
            .await?;

        let count: i64 = row.get("count");
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Distinct domains that have pending transfers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn pending_domains(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"SELECT DISTINCT domain FROM transfers WHERE status = ? ORDER BY domain ASC",
        )
        .bind(TransferStatus::Pending.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get("domain")).collect())
    }

    /// Claims the oldest pending transfer for `domain`, moving it to queued and
    /// attaching `batch_id`.
    ///
    /// Atomic UPDATE...RETURNING ensures two claimers never receive the same row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim_next_pending(
        &self,
        domain: &str,
        batch_id: &str,
    ) -> Result<Option<TransferRecord>> {
        let record = sqlx::query_as::<_, TransferRecord>(
            r"UPDATE transfers
              SET status = ?, batch_id = ?, updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM transfers
                  WHERE domain = ? AND status = ?
                  ORDER BY queued_at ASC, id ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .bind(TransferStatus::Queued.as_str())
        .bind(batch_id)
        .bind(domain)
        .bind(TransferStatus::Pending.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Queued → preparing for the given batch; stamps `started_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_preparing(&self, id: i64, batch_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE transfers
              SET status = ?, started_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
                  updated_at = datetime('now')
              WHERE id = ? AND batch_id = ? AND status = ?",
        )
        .bind(TransferStatus::Preparing.as_str())
        .bind(id)
        .bind(batch_id)
        .bind(TransferStatus::Queued.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Preparing → downloading for the given batch, recording the planned total.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_downloading(
        &self,
        id: i64,
        batch_id: &str,
        bytes_total: Option<u64>,
    ) -> Result<bool> {
        let total = bytes_total.and_then(|value| i64::try_from(value).ok());
        let result = sqlx::query(
            r"UPDATE transfers
              SET status = ?, bytes_total = ?, bytes_downloaded = 0,
                  last_broadcast_percent = NULL, updated_at = datetime('now')
              WHERE id = ? AND batch_id = ? AND status = ?",
        )
        .bind(TransferStatus::Downloading.as_str())
        .bind(total)
        .bind(id)
        .bind(batch_id)
        .bind(TransferStatus::Preparing.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Adds `delta` (possibly negative, for a rewound chunk) to the downloaded
    /// counter, clamped to `[0, bytes_total]`.
    ///
    /// Returns `None` when `batch_id` is no longer the transfer's batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(level = "trace", skip(self))]
    pub async fn add_downloaded(
        &self,
        id: i64,
        batch_id: &str,
        delta: i64,
    ) -> Result<Option<ProgressSnapshot>> {
        let row = sqlx::query(
            r"UPDATE transfers
              SET bytes_downloaded = MAX(0, MIN(bytes_downloaded + ?1,
                                                COALESCE(bytes_total, bytes_downloaded + ?1))),
                  updated_at = datetime('now')
              WHERE id = ?2 AND batch_id = ?3
              RETURNING bytes_downloaded, bytes_total, last_broadcast_percent",
        )
        .bind(delta)
        .bind(id)
        .bind(batch_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|row| {
            let downloaded: i64 = row.get("bytes_downloaded");
            let total: Option<i64> = row.get("bytes_total");
            let last: Option<i64> = row.get("last_broadcast_percent");
            ProgressSnapshot {
                bytes_downloaded: u64::try_from(downloaded).unwrap_or(0),
                bytes_total: total.and_then(|value| u64::try_from(value).ok()),
                last_broadcast_percent: last.and_then(|value| u8::try_from(value).ok()),
            }
        }))
    }

    /// Records `percent` as the value most recently pushed to observers.
    ///
    /// Returns `false` when the stored percent already equals `percent` or the
    /// batch is stale, so concurrent workers emit each percent once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(level = "trace", skip(self))]
    pub async fn set_broadcast_percent(&self, id: i64, batch_id: &str, percent: u8) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE transfers SET last_broadcast_percent = ?1
              WHERE id = ?2 AND batch_id = ?3
                AND (last_broadcast_percent IS NULL OR last_broadcast_percent <> ?1)",
        )
        .bind(i64::from(percent))
        .bind(id)
        .bind(batch_id)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Downloading → assembling for the given batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_assembling(&self, id: i64, batch_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE transfers
              SET status = ?, updated_at = datetime('now')
              WHERE id = ? AND batch_id = ? AND status = ?",
        )
        .bind(TransferStatus::Assembling.as_str())
        .bind(id)
        .bind(batch_id)
        .bind(TransferStatus::Downloading.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Assembling → completed; the final size becomes both total and downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_completed(&self, id: i64, batch_id: &str, size: u64) -> Result<bool> {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r"UPDATE transfers
              SET status = ?, bytes_total = ?, bytes_downloaded = ?,
                  last_broadcast_percent = 100, batch_id = NULL, error = NULL,
                  finished_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
                  updated_at = datetime('now')
              WHERE id = ? AND batch_id = ? AND status = ?",
        )
        .bind(TransferStatus::Completed.as_str())
        .bind(size)
        .bind(size)
        .bind(id)
        .bind(batch_id)
        .bind(TransferStatus::Assembling.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Slot-holding → failed for the given batch, recording `error`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self, error))]
    pub async fn mark_failed(&self, id: i64, batch_id: &str, error: &str) -> Result<bool> {
        let sql = format!(
            r"UPDATE transfers
              SET status = ?, error = ?, batch_id = NULL,
                  failed_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
                  updated_at = datetime('now')
              WHERE id = ? AND batch_id = ? AND status IN ({})",
            sql_status_list(&TransferStatus::SLOT_HOLDING)
        );
        let result = sqlx::query(&sql)
            .bind(TransferStatus::Failed.as_str())
            .bind(error)
            .bind(id)
            .bind(batch_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Pausable → paused. Progress counters are kept; the batch is detached.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_paused(&self, id: i64) -> Result<bool> {
        let sql = format!(
            r"UPDATE transfers
              SET status = ?, batch_id = NULL, updated_at = datetime('now')
              WHERE id = ? AND status IN ({})",
            sql_status_list(&PAUSABLE)
        );
        let result = sqlx::query(&sql)
            .bind(TransferStatus::Paused.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Any non-terminal, non-canceled status → canceled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_canceled(&self, id: i64) -> Result<bool> {
        let sql = format!(
            r"UPDATE transfers
              SET status = ?, batch_id = NULL, updated_at = datetime('now')
              WHERE id = ? AND status NOT IN ({})",
            sql_status_list(&UNCANCELABLE)
        );
        let result = sqlx::query(&sql)
            .bind(TransferStatus::Canceled.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Full reset back to pending: clears progress, timestamps, batch and error,
    /// and re-stamps `queued_at` so the transfer rejoins the back of its domain's
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset(&self, id: i64) -> Result<bool> {
        let sql = format!(
            r"UPDATE transfers
              SET status = ?, bytes_total = NULL, bytes_downloaded = 0,
                  last_broadcast_percent = NULL, batch_id = NULL, error = NULL,
                  queued_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
                  started_at = NULL, finished_at = NULL, failed_at = NULL,
                  updated_at = datetime('now')
              WHERE id = ? AND status IN ({})",
            sql_status_list(&RESETTABLE)
        );
        let result = sqlx::query(&sql)
            .bind(TransferStatus::Pending.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes a transfer. Its chunks go with it (foreign-key cascade).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TransferNotFound`] if no transfer exists with the given ID.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM chunks WHERE transfer_id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        let result = sqlx::query(r"DELETE FROM transfers WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }
}
