//! Blob store holding raw segment bytes.
//!
//! Keys are opaque strings (the pipeline always uses
//! `segments/{file_id}/{order_index}`). `FsBlobStore` maps each key onto a path
//! beneath a root directory.

use crate::services::storage_service::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous value.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Fetch the bytes under `key`. Missing keys yield `BlobNotFound`.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Remove `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Readiness check.
    async fn probe(&self) -> StorageResult<()> {
        Ok(())
    }
}

const MAX_BLOB_KEY_LEN: usize = 1024;

/// Filesystem-backed blob store rooted at `base_path`.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Reject keys that could escape `base_path`.
    ///
    /// Keys must be non-empty, relative, free of `..` segments, backslashes and
    /// control characters.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_BLOB_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(StorageError::InvalidBlobKey(key.to_string()));
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> StorageResult<PathBuf> {
        Self::ensure_key_safe(key)?;
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    /// Write to a temporary sibling, fsync, then rename into place so readers
    /// never observe a partially written blob.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.blob_path(key)?;
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!("stored blob {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.blob_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::BlobNotFound(key.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob {}", key),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", key);
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Write, read back and remove a scratch file under `base_path`.
    async fn probe(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

impl FsBlobStore {
    /// Remove empty directories from `start` up to, but excluding, `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}
