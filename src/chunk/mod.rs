//! Chunk plans and their durable records.
//!
//! A transfer's chunks are created in bulk when it is planned and deleted in
//! bulk on any reset. Part files live on the temp disk under a directory keyed
//! by transfer and batch, see [`part_key`].

mod planner;
mod record;

pub use planner::{ChunkPlan, ChunkPlanner, plan_ranges};
pub use record::{ByteRange, ChunkRecord, ChunkStatus};

use tracing::instrument;

use crate::db::Database;
use crate::transfer::{Result, StoreError};

/// Root of the transfer namespace on the temp disk.
pub const TEMP_ROOT: &str = "transfers";

/// Temp directory owned by one transfer.
#[must_use]
pub fn transfer_temp_dir(transfer_id: i64) -> String {
    format!("{TEMP_ROOT}/{transfer_id}")
}

/// Temp directory owned by one batch of one transfer.
#[must_use]
pub fn batch_temp_dir(transfer_id: i64, batch_id: &str) -> String {
    format!("{TEMP_ROOT}/{transfer_id}/{batch_id}")
}

/// Temp key of a chunk's part file.
#[must_use]
pub fn part_key(transfer_id: i64, batch_id: &str, index: usize) -> String {
    format!("{}/part-{index:05}", batch_temp_dir(transfer_id, batch_id))
}

/// SQLite-backed chunk store.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    db: Database,
}

impl ChunkStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replaces the transfer's chunks with one record per planned range.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the transaction fails; no chunk is
    /// created in that case.
    #[instrument(skip(self, plan), fields(chunks = plan.ranges.len()))]
    pub async fn create_plan(
        &self,
        transfer_id: i64,
        batch_id: &str,
        plan: &ChunkPlan,
    ) -> Result<Vec<ChunkRecord>> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(r"DELETE FROM chunks WHERE transfer_id = ?")
            .bind(transfer_id)
            .execute(&mut *tx)
            .await?;

        let mut records = Vec::with_capacity(plan.ranges.len());
        for (index, range) in plan.ranges.iter().enumerate() {
            let record = sqlx::query_as::<_, ChunkRecord>(
                r"INSERT INTO chunks (transfer_id, chunk_index, range_start, range_end, ranged, part_path, status)
                  VALUES (?, ?, ?, ?, ?, ?, ?)
                  RETURNING *",
            )
            .bind(transfer_id)
            .bind(i64::try_from(index).unwrap_or(i64::MAX))
            .bind(i64::try_from(range.start).unwrap_or(i64::MAX))
            .bind(i64::try_from(range.end).unwrap_or(i64::MAX))
            .bind(plan.ranged)
            .bind(part_key(transfer_id, batch_id, index))
            .bind(ChunkStatus::Pending.as_str())
            .fetch_one(&mut *tx)
            .await?;
            records.push(record);
        }

        tx.commit().await?;
        Ok(records)
    }

    /// Lists a transfer's chunks in range order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(&self, transfer_id: i64) -> Result<Vec<ChunkRecord>> {
        let records = sqlx::query_as::<_, ChunkRecord>(
            r"SELECT * FROM chunks WHERE transfer_id = ? ORDER BY chunk_index ASC",
        )
        .bind(transfer_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Gets a chunk by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get(&self, id: i64) -> Result<Option<ChunkRecord>> {
        let record = sqlx::query_as::<_, ChunkRecord>(r"SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(record)
    }

    async fn set_status(&self, id: i64, status: ChunkStatus) -> Result<bool> {
        let result = sqlx::query(r"UPDATE chunks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_in_flight(&self, id: i64) -> Result<bool> {
        self.set_status(id, ChunkStatus::InFlight).await
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_done(&self, id: i64) -> Result<bool> {
        self.set_status(id, ChunkStatus::Done).await
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_failed(&self, id: i64) -> Result<bool> {
        self.set_status(id, ChunkStatus::Failed).await
    }

    /// Adds freshly flushed bytes to the chunk's counter. Returns false when the
    /// chunk no longer exists (its transfer was reset underneath the worker).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(level = "trace", skip(self))]
    pub async fn add_written(&self, id: i64, delta: u64) -> Result<bool> {
        let result =
            sqlx::query(r"UPDATE chunks SET bytes_written = bytes_written + ? WHERE id = ?")
                .bind(i64::try_from(delta).unwrap_or(i64::MAX))
                .bind(id)
                .execute(self.db.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Zeroes the chunk's counter before an unranged restart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn reset_written(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(r"UPDATE chunks SET bytes_written = 0 WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// True when the transfer has chunks and every one is done.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn all_done(&self, transfer_id: i64) -> Result<bool> {
        let (total, done): (i64, i64) = sqlx::query_as(
            r"SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'done' THEN 1 ELSE 0 END), 0)
              FROM chunks WHERE transfer_id = ?",
        )
        .bind(transfer_id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(total > 0 && total == done)
    }

    /// Deletes one chunk record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChunkNotFound`] if it does not exist.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query(r"DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ChunkNotFound(id));
        }
        Ok(())
    }

    /// Deletes every chunk of a transfer, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_for_transfer(&self, transfer_id: i64) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM chunks WHERE transfer_id = ?")
            .bind(transfer_id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Part keys of every chunk on record, across all transfers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn all_part_paths(&self) -> Result<Vec<String>> {
        let paths: Vec<(String,)> = sqlx::query_as(r"SELECT part_path FROM chunks")
            .fetch_all(self.db.pool())
            .await?;
        Ok(paths.into_iter().map(|(path,)| path).collect())
    }
}
