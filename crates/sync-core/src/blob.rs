//! Content-addressed blob storage shared by all peers.
//!
//! Keys are [`ContentHash`]es, so a blob never changes once written and
//! writing an existing key again is a no-op.

use crate::event::ContentHash;
use crate::fs_util::is_not_found;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found in store")]
    Missing,

    #[error("Blob store unavailable: {0}")]
    Unavailable(String),

    #[error("Downloaded content hashes to {actual}")]
    Corrupt { actual: ContentHash },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BlobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlobError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Upload/download of whole files keyed by content hash.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `local_path` under `key`.
    async fn put(&self, local_path: &Path, key: &ContentHash) -> Result<()>;

    /// Download `key` into `dest_path`, replacing its contents.
    async fn get(&self, dest_path: &Path, key: &ContentHash) -> Result<()>;
}

/// Blob store backed by a directory, typically a shared or mounted volume.
pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Create the backing directory if needed.
    pub async fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self::new(dir))
    }

    fn blob_path(&self, key: &ContentHash) -> PathBuf {
        self.dir.join(key.as_str())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, local_path: &Path, key: &ContentHash) -> Result<()> {
        let target = self.blob_path(key);
        if fs::try_exists(&target).await.unwrap_or(false) {
            debug!("Blob {} already stored", key.short(12));
            return Ok(());
        }

        // Readers must never observe a half-written blob
        let partial = self.dir.join(format!(".{}.{}", key, uuid::Uuid::new_v4()));
        if let Err(e) = fs::copy(local_path, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&partial, &target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        debug!("Stored blob {}", key.short(12));
        Ok(())
    }

    async fn get(&self, dest_path: &Path, key: &ContentHash) -> Result<()> {
        match fs::copy(self.blob_path(key), dest_path).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(BlobError::Missing),
            Err(e) => Err(e.into()),
        }
    }
}
