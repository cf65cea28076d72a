//! Object storage seam for the temp disk and the permanent disk.
//!
//! Keys are relative, `/`-separated paths. The engine only talks to
//! [`ObjectStorage`]; [`LocalDisk`] maps keys onto a directory tree.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, instrument};

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure while touching a key.
    #[error("storage IO error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Key is empty, absolute, or escapes the storage root.
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}

impl StorageError {
    fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }
}

/// Streaming handle returned by [`ObjectStorage::open`].
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte storage addressed by relative keys.
#[async_trait]
pub trait ObjectStorage: Send + Sync + std::fmt::Debug {
    /// Creates or truncates `key` with `data`.
    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Appends `data` to `key`, creating it if missing.
    async fn append(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Reads the whole object.
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Opens the object for streaming reads.
    async fn open(&self, key: &str) -> Result<ObjectReader, StorageError>;

    /// Streams `reader` onto the end of `key`, creating it if missing, and
    /// returns the bytes copied. Memory use is bounded by the copy buffer.
    async fn append_from(
        &self,
        key: &str,
        reader: &mut ObjectReader,
    ) -> Result<u64, StorageError>;

    /// Moves `from` to `to`, replacing whatever `to` held.
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Deletes one object. Returns false if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Deletes a directory and everything below it. Returns false if it did not exist.
    async fn delete_dir(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Size of the object in bytes.
    async fn size(&self, key: &str) -> Result<u64, StorageError>;

    /// Names of the entries directly below `key`, sorted. Empty when missing.
    async fn list_dir(&self, key: &str) -> Result<Vec<String>, StorageError>;
}

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalDisk {
    root: PathBuf,
}

impl LocalDisk {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key under the root, rejecting anything but plain path segments.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for empty, absolute or `..` keys.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(key, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for LocalDisk {
    #[instrument(level = "debug", skip(self, data), fields(bytes = data.len()))]
    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        self.ensure_parent(key, &path).await?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        self.ensure_parent(key, &path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.flush().await.map_err(|e| StorageError::io(key, e))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn open(&self, key: &str) -> Result<ObjectReader, StorageError> {
        let path = self.resolve(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        Ok(Box::new(file))
    }

    async fn append_from(
        &self,
        key: &str,
        reader: &mut ObjectReader,
    ) -> Result<u64, StorageError> {
        let path = self.resolve(key)?;
        self.ensure_parent(key, &path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        let copied = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.flush().await.map_err(|e| StorageError::io(key, e))?;
        Ok(copied)
    }

    #[instrument(level = "debug", skip(self))]
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        self.ensure_parent(to, &target).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| StorageError::io(from, e))
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete_dir(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed directory");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.resolve(key)?;
        tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.len())
            .map_err(|e| StorageError::io(key, e))
    }

    async fn list_dir(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let path = self.resolve(key)?;
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(key, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(key, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
