//! The owning asset catalog.
//!
//! The engine reads an asset's source URL and stored paths, and writes back
//! only through the narrow side effects on [`AssetCatalog`].

use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;
use crate::transfer::DbErrorKind;

/// Errors raised by catalog implementations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog database error ({kind}): {message}")]
    Database { kind: DbErrorKind, message: String },

    #[error("asset not found: id {0}")]
    MissingAsset(i64),
}

impl From<sqlx::Error> for CatalogError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

/// Catalog record of one media asset.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Asset {
    pub id: i64,
    pub source_url: String,
    /// Key of the stored file on the permanent disk.
    pub path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub downloaded: bool,
    pub size: Option<i64>,
    /// Progress indicator mirrored from the active transfer.
    pub progress: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Side effects the engine applies to the owning asset.
#[async_trait]
pub trait AssetCatalog: Send + Sync + std::fmt::Debug {
    async fn asset(&self, id: i64) -> Result<Asset, CatalogError>;

    /// Mirrors a transfer's percent onto the asset.
    async fn set_progress(&self, id: i64, percent: u8) -> Result<(), CatalogError>;

    /// Records a completed download.
    async fn mark_downloaded(&self, id: i64, path: &str, size: u64) -> Result<(), CatalogError>;

    /// Clears the downloaded flag, stored paths, size and progress.
    async fn clear_download(&self, id: i64) -> Result<(), CatalogError>;
}

/// Catalog over the `assets` table.
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    db: Database,
}

impl SqliteCatalog {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers a new asset for `source_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Database`] if the insert fails.
    #[instrument(skip(self))]
    pub async fn insert_asset(&self, source_url: &str) -> Result<Asset, CatalogError> {
        let asset =
            sqlx::query_as::<_, Asset>(r"INSERT INTO assets (source_url) VALUES (?) RETURNING *")
                .bind(source_url)
                .fetch_one(self.db.pool())
                .await?;
        Ok(asset)
    }

    /// Sets the asset's thumbnail key.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::MissingAsset`] for an unknown ID.
    pub async fn set_thumbnail(&self, id: i64, key: &str) -> Result<(), CatalogError> {
        let result = sqlx::query(
            r"UPDATE assets SET thumbnail_path = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(key)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        check_found(id, result.rows_affected())
    }
}

fn check_found(id: i64, rows_affected: u64) -> Result<(), CatalogError> {
    if rows_affected == 0 {
        Err(CatalogError::MissingAsset(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl AssetCatalog for SqliteCatalog {
    async fn asset(&self, id: i64) -> Result<Asset, CatalogError> {
        sqlx::query_as::<_, Asset>(r"SELECT * FROM assets WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(CatalogError::MissingAsset(id))
    }

    #[instrument(level = "trace", skip(self))]
    async fn set_progress(&self, id: i64, percent: u8) -> Result<(), CatalogError> {
        let result = sqlx::query(
            r"UPDATE assets SET progress = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(i64::from(percent.min(100)))
        .bind(id)
        .execute(self.db.pool())
        .await?;
        check_found(id, result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn mark_downloaded(&self, id: i64, path: &str, size: u64) -> Result<(), CatalogError> {
        let result = sqlx::query(
            r"UPDATE assets
              SET downloaded = 1, path = ?, size = ?, progress = 100, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(path)
        .bind(i64::try_from(size).unwrap_or(i64::MAX))
        .bind(id)
        .execute(self.db.pool())
        .await?;
        check_found(id, result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn clear_download(&self, id: i64) -> Result<(), CatalogError> {
        let result = sqlx::query(
            r"UPDATE assets
              SET downloaded = 0, path = NULL, thumbnail_path = NULL, size = NULL, progress = 0,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;
        check_found(id, result.rows_affected())
    }
}
