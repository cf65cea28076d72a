//! Transfer Engine Library
//!
//! Resumable, chunked downloads of catalog assets with per-domain admission
//! control. Each transfer is planned into byte-range chunks, fetched by a
//! shared worker pool with pacing and retries, assembled onto the permanent
//! disk and mirrored back onto its asset.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`transfer`] - Transfer records, status machine and store
//! - [`chunk`] - Chunk planning and chunk records
//! - [`download`] - HTTP client, rate limiting, retries, chunk workers and assembly
//! - [`engine`] - Admission, job-batches, commands and recovery
//! - [`storage`] - Temp and permanent disk abstraction
//! - [`catalog`] - The asset catalog the engine reports to
//! - [`events`] - Progress and status events
//! - [`config`] - Engine configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod db;
pub mod download;
pub mod engine;
pub mod events;
pub mod storage;
#[cfg(test)]
pub mod test_support;
pub mod transfer;

// Re-export commonly used types
pub use catalog::{Asset, AssetCatalog, CatalogError, SqliteCatalog};
pub use chunk::{ByteRange, ChunkPlan, ChunkRecord, ChunkStatus};
pub use config::{ConfigError, EngineConfig};
pub use db::{Database, DbError};
pub use download::{DownloadError, FailureType, HttpClient, RateLimiter, RetryPolicy};
pub use engine::{
    ActionError, CeilingResolver, ConfiguredCeilings, EngineError, RecoveryReport, TransferEngine,
};
pub use events::TransferEvent;
pub use storage::{LocalDisk, ObjectReader, ObjectStorage, StorageError};
pub use transfer::{StoreError, TransferAction, TransferRecord, TransferStatus};
