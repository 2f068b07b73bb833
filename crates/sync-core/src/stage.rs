//! Staging and hashing of file content.
//!
//! Content never moves straight from the synced tree to the blob store or the
//! other way round. It is first copied into a private scratch directory, hashed
//! there, and promoted into the content-addressed cache (`cache_dir/<hash>`).
//! The scratch and cache directories must live on the same filesystem as the
//! sync root so every promotion is an atomic rename.

use crate::event::ContentHash;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Compute the content hash of a file.
pub async fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash::from_digest(hasher.finalize().as_slice()))
}

/// A temporary file owned by whoever staged it.
///
/// Dropping a staged file that was never promoted or placed deletes it.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give up ownership of the file, e.g. after renaming it elsewhere.
    pub fn disarm(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Delete the file now.
    pub async fn discard(mut self) {
        self.armed = false;
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove staged file {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Owner of the scratch and cache directories.
#[derive(Debug, Clone)]
pub struct Stager {
    tmp_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Stager {
    pub fn new(tmp_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self { tmp_dir, cache_dir }
    }

    /// Create the scratch and cache directories if they do not exist.
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.tmp_dir).await?;
        fs::create_dir_all(&self.cache_dir).await
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_path(&self, hash: &ContentHash) -> PathBuf {
        self.cache_dir.join(hash.as_str())
    }

    pub async fn is_cached(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.cache_path(hash)).await.unwrap_or(false)
    }

    fn scratch_path(&self) -> PathBuf {
        self.tmp_dir.join(format!("stage-{}", uuid::Uuid::new_v4()))
    }

    /// Reserve an empty scratch file, e.g. as a download target.
    pub async fn reserve(&self) -> io::Result<StagedFile> {
        let path = self.scratch_path();
        fs::File::create(&path).await?;
        Ok(StagedFile::new(path))
    }

    /// Copy `source` into a fresh scratch file.
    ///
    /// Fails with `NotFound` if the source disappears before or during the copy.
    pub async fn stage(&self, source: &Path) -> io::Result<StagedFile> {
        let staged = StagedFile::new(self.scratch_path());
        fs::copy(source, staged.path()).await?;
        Ok(staged)
    }

    /// Move a staged file into the cache under its hash.
    ///
    /// If the cache already holds that hash the staged copy is dropped: cache
    /// entries are immutable and identical by construction.
    pub async fn promote(&self, staged: StagedFile, hash: &ContentHash) -> io::Result<PathBuf> {
        let cached = self.cache_path(hash);
        if fs::try_exists(&cached).await.unwrap_or(false) {
            debug!("Cache already holds {}", hash.short(12));
            staged.discard().await;
            return Ok(cached);
        }

        // On failure `staged` is dropped and its file removed
        fs::rename(staged.path(), &cached).await?;
        staged.disarm();
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stager(temp: &TempDir) -> Stager {
        Stager::new(temp.path().join("tmp"), temp.path().join("cache"))
    }

    fn scratch_entries(stager: &Stager) -> usize {
        std::fs::read_dir(stager.tmp_dir()).unwrap().count()
    }

    #[tokio::test]
    async fn test_hash_file_matches_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.txt");
        let data = vec![7u8; HASH_BUF_SIZE * 2 + 13];
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), ContentHash::of_bytes(&data));
    }

    #[tokio::test]
    async fn test_stage_and_promote() {
        let temp = TempDir::new().unwrap();
        let stager = stager(&temp);
        stager.ensure_dirs().await.unwrap();

        let src = temp.path().join("notes.txt");
        std::fs::write(&src, b"hello").unwrap();

        let staged = stager.stage(&src).await.unwrap();
        let hash = hash_file(staged.path()).await.unwrap();
        let cached = stager.promote(staged, &hash).await.unwrap();

        assert_eq!(cached, stager.cache_path(&hash));
        assert_eq!(std::fs::read(&cached).unwrap(), b"hello");
        assert!(stager.is_cached(&hash).await);
        assert_eq!(scratch_entries(&stager), 0);
    }

    #[tokio::test]
    async fn test_promote_duplicate_content_drops_copy() {
        let temp = TempDir::new().unwrap();
        let stager = stager(&temp);
        stager.ensure_dirs().await.unwrap();

        let src = temp.path().join("a.txt");
        std::fs::write(&src, b"same bytes").unwrap();
        let hash = ContentHash::of_bytes(b"same bytes");

        let first = stager.stage(&src).await.unwrap();
        let second = stager.stage(&src).await.unwrap();
        stager.promote(first, &hash).await.unwrap();
        stager.promote(second, &hash).await.unwrap();

        assert_eq!(scratch_entries(&stager), 0);
        assert_eq!(std::fs::read_dir(stager.cache_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_stage_missing_source_is_not_found() {
        let temp = TempDir::new().unwrap();
        let stager = stager(&temp);
        stager.ensure_dirs().await.unwrap();

        let err = stager.stage(&temp.path().join("missing")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(scratch_entries(&stager), 0);
    }

    #[tokio::test]
    async fn test_dropped_staged_file_is_removed() {
        let temp = TempDir::new().unwrap();
        let stager = stager(&temp);
        stager.ensure_dirs().await.unwrap();

        let reserved = stager.reserve().await.unwrap();
        assert!(reserved.path().exists());
        drop(reserved);
        assert_eq!(scratch_entries(&stager), 0);
    }
}
