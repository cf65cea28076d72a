//! Concatenates finished part files into a staged asset file, then promotes
//! it to the asset's permanent key.
//!
//! Each batch assembles into its own staging key, so a batch that lost its
//! transfer can only ever remove bytes it wrote itself.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use crate::chunk::{ChunkRecord, ChunkStatus};
use crate::storage::ObjectStorage;

/// Permanent-disk directory holding assemblies in progress.
pub const STAGING_ROOT: &str = "staging";

const STAGING_SUFFIX: &str = ".partial";

/// Staging key for one batch of one transfer.
#[must_use]
pub fn staging_key(transfer_id: i64, batch_id: &str) -> String {
    format!("{STAGING_ROOT}/{transfer_id}-{batch_id}{STAGING_SUFFIX}")
}

/// Splits a staging file name back into its transfer id and batch id.
#[must_use]
pub fn parse_staging_name(name: &str) -> Option<(i64, &str)> {
    let (transfer_id, batch_id) = name.strip_suffix(STAGING_SUFFIX)?.split_once('-')?;
    Some((transfer_id.parse().ok()?, batch_id))
}

/// Joins a transfer's parts, in range order, onto the permanent disk.
#[derive(Debug, Clone)]
pub struct Assembler {
    temp: Arc<dyn ObjectStorage>,
    permanent: Arc<dyn ObjectStorage>,
}

impl Assembler {
    #[must_use]
    pub fn new(temp: Arc<dyn ObjectStorage>, permanent: Arc<dyn ObjectStorage>) -> Self {
        Self { temp, permanent }
    }

    /// Streams the concatenation of `chunks` into `staging` and returns its
    /// size.
    ///
    /// Every chunk must be done and every part must hold exactly the bytes its
    /// range covers. When `bytes_total` is known the assembled size must match
    /// it. Parts are copied one at a time through a bounded buffer. On any
    /// failure, cancellation included, the staged file is removed; part files
    /// are left for inspection.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::MissingPart`], [`DownloadError::Integrity`],
    /// [`DownloadError::Canceled`] or the storage error that interrupted
    /// assembly.
    #[instrument(skip(self, chunks, cancel), fields(parts = chunks.len()))]
    pub async fn assemble(
        &self,
        chunks: &[ChunkRecord],
        bytes_total: Option<u64>,
        staging: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
        ordered.sort_by_key(|chunk| chunk.chunk_index);

        if let Some(missing) = ordered.iter().find(|c| c.status() != ChunkStatus::Done) {
            return Err(DownloadError::MissingPart {
                index: missing.chunk_index,
            });
        }
        if ordered.is_empty() {
            return Err(DownloadError::MissingPart { index: 0 });
        }

        match self.concatenate(&ordered, bytes_total, staging, cancel).await {
            Ok(size) => {
                debug!(size, staging, "staged asset");
                Ok(size)
            }
            Err(error) => {
                self.discard(staging).await;
                Err(error)
            }
        }
    }

    /// Moves a staged assembly onto the asset's permanent key.
    ///
    /// # Errors
    ///
    /// Returns the storage error from the move. The staged file is removed.
    pub async fn promote(&self, staging: &str, dest_key: &str) -> Result<(), DownloadError> {
        if let Err(error) = self.permanent.rename(staging, dest_key).await {
            self.discard(staging).await;
            return Err(error.into());
        }
        info!(dest = dest_key, "assembled asset");
        Ok(())
    }

    /// Removes a staged assembly; missing files are fine.
    pub async fn discard(&self, staging: &str) {
        if let Err(error) = self.permanent.delete(staging).await {
            warn!(error = %error, staging, "could not remove staged asset");
        }
    }

    async fn concatenate(
        &self,
        ordered: &[&ChunkRecord],
        bytes_total: Option<u64>,
        staging: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        self.permanent.write(staging, &[]).await?;

        let mut size = 0u64;
        for chunk in ordered {
            if cancel.is_cancelled() {
                return Err(DownloadError::Canceled);
            }

            let part_len = self.temp.size(&chunk.part_path).await?;
            if let Some(expected) = chunk.expected_len() {
                if part_len != expected {
                    return Err(DownloadError::integrity(&chunk.part_path, expected, part_len));
                }
            }

            let mut reader = self.temp.open(&chunk.part_path).await?;
            let copied = tokio::select! {
                () = cancel.cancelled() => return Err(DownloadError::Canceled),
                copied = self.permanent.append_from(staging, &mut reader) => copied?,
            };
            if copied != part_len {
                return Err(DownloadError::integrity(&chunk.part_path, part_len, copied));
            }
            size += copied;
            debug!(index = chunk.chunk_index, bytes = copied, "appended part");
        }

        let stored = self.permanent.size(staging).await?;
        if stored != size {
            return Err(DownloadError::integrity(staging, size, stored));
        }
        if let Some(expected) = bytes_total {
            if size != expected {
                return Err(DownloadError::integrity(staging, expected, size));
            }
        }
        Ok(size)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::chunk::{ByteRange, ChunkPlan, ChunkStore};
    use crate::db::Database;
    use crate::storage::LocalDisk;
    use crate::transfer::TransferStore;

    struct Fixture {
        chunks: ChunkStore,
        records: Vec<ChunkRecord>,
        temp: Arc<LocalDisk>,
        permanent: Arc<LocalDisk>,
        _temp_dir: tempfile::TempDir,
        _perm_dir: tempfile::TempDir,
    }

    async fn fixture(plan: ChunkPlan, parts: &[&[u8]]) -> Fixture {
        let db = Database::new_in_memory().await.unwrap();
        let transfer = TransferStore::new(db.clone())
            .create(1, "https://a.example/f.bin", "a.example")
            .await
            .unwrap();
        let chunks = ChunkStore::new(db);
        let records = chunks.create_plan(transfer.id, "b", &plan).await.unwrap();

        let temp_dir = tempfile::tempdir().unwrap();
        let perm_dir = tempfile::tempdir().unwrap();
        let temp = Arc::new(LocalDisk::new(temp_dir.path()));
        for (record, data) in records.iter().zip(parts) {
            temp.write(&record.part_path, data).await.unwrap();
            chunks.mark_done(record.id).await.unwrap();
        }
        let records = chunks.list(transfer.id).await.unwrap();

        Fixture {
            chunks,
            records,
            temp,
            permanent: Arc::new(LocalDisk::new(perm_dir.path())),
            _temp_dir: temp_dir,
            _perm_dir: perm_dir,
        }
    }

    const STAGING: &str = "staging/1-b.partial";

    fn assembler(fx: &Fixture) -> Assembler {
        Assembler::new(fx.temp.clone(), fx.permanent.clone())
    }

    async fn assemble(
        fx: &Fixture,
        chunks: &[ChunkRecord],
        total: Option<u64>,
    ) -> Result<u64, DownloadError> {
        assembler(fx)
            .assemble(chunks, total, STAGING, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_parts_are_joined_in_range_order() {
        let plan = ChunkPlan::ranged(
            10,
            vec![ByteRange::new(0, 4), ByteRange::new(4, 8), ByteRange::new(8, 10)],
        );
        let fx = fixture(plan, &[b"0123", b"4567", b"89"]).await;
        let mut reversed = fx.records.clone();
        reversed.reverse();

        let size = assemble(&fx, &reversed, Some(10)).await.unwrap();
        assert_eq!(size, 10);

        assembler(&fx).promote(STAGING, "assets/1/f.bin").await.unwrap();
        assert_eq!(
            fx.permanent.read("assets/1/f.bin").await.unwrap(),
            b"0123456789"
        );
        assert!(!fx.permanent.exists(STAGING).await.unwrap());
    }

    #[tokio::test]
    async fn test_short_part_fails_integrity_and_removes_staging() {
        let plan = ChunkPlan::ranged(8, vec![ByteRange::new(0, 4), ByteRange::new(4, 8)]);
        let fx = fixture(plan, &[b"0123", b"45"]).await;
        fx.permanent.write("assets/1/f.bin", b"earlier").await.unwrap();

        let result = assemble(&fx, &fx.records, Some(8)).await;
        assert!(matches!(result, Err(DownloadError::Integrity { .. })));
        assert!(!fx.permanent.exists(STAGING).await.unwrap());
        assert_eq!(
            fx.permanent.read("assets/1/f.bin").await.unwrap(),
            b"earlier"
        );
        assert!(fx.temp.exists(&fx.records[0].part_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_unfinished_chunk_is_a_missing_part() {
        let plan = ChunkPlan::ranged(8, vec![ByteRange::new(0, 4), ByteRange::new(4, 8)]);
        let fx = fixture(plan, &[b"0123", b"4567"]).await;
        fx.chunks.mark_failed(fx.records[1].id).await.unwrap();
        let records = fx.chunks.list(fx.records[0].transfer_id).await.unwrap();

        let result = assemble(&fx, &records, Some(8)).await;
        assert!(matches!(result, Err(DownloadError::MissingPart { index: 1 })));
    }

    #[tokio::test]
    async fn test_unknown_total_takes_assembled_size() {
        let fx = fixture(ChunkPlan::whole(None), &[b"whole body"]).await;
        let size = assemble(&fx, &fx.records, None).await.unwrap();
        assert_eq!(size, 10);
    }

    #[tokio::test]
    async fn test_total_mismatch_is_rejected() {
        let fx = fixture(ChunkPlan::whole(None), &[b"whole body"]).await;
        let result = assemble(&fx, &fx.records, Some(11)).await;
        assert!(matches!(
            result,
            Err(DownloadError::Integrity {
                expected_bytes: 11,
                actual_bytes: 10,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_canceled_assembly_leaves_no_staged_file() {
        let fx = fixture(ChunkPlan::whole(None), &[b"whole body"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = assembler(&fx)
            .assemble(&fx.records, None, STAGING, &cancel)
            .await;
        assert!(matches!(result, Err(DownloadError::Canceled)));
        assert!(!fx.permanent.exists(STAGING).await.unwrap());
    }

    #[test]
    fn test_staging_names_round_trip_through_parse() {
        let key = staging_key(12, "3f2a-77");
        let name = key.strip_prefix("staging/").unwrap();
        assert_eq!(parse_staging_name(name), Some((12, "3f2a-77")));
        assert_eq!(parse_staging_name("notes.txt"), None);
        assert_eq!(parse_staging_name("x-y.partial"), None);
    }
}
