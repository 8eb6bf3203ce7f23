//! Filesystem blob store.
//!
//! This module provides [`BlobStore`], which addresses archive blobs by
//! transfer id under two roots:
//!
//! - `storage_root/{id}`: the finalized, encrypted-at-rest archive
//! - `temp_root/{id}.partial`: a plaintext archive still being built
//! - `temp_root/decrypted/`: ephemeral decrypted copies
//!
//! Transfer ids are validated before they are joined onto a root, so an id
//! can never escape its directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{DropVaultError, Result};

const CACHE_SUBDIR: &str = "decrypted";

#[derive(Debug, Clone)]
pub struct BlobStore {
    storage_root: PathBuf,
    temp_root: PathBuf,
}

/// Accept only ids made of ASCII alphanumerics and `-` (UUIDs and the like).
pub fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(DropVaultError::InvalidTransferId(id.to_string()))
    }
}

impl BlobStore {
    pub fn new(storage_root: impl Into<PathBuf>, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            temp_root: temp_root.into(),
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.temp_root.join(CACHE_SUBDIR)
    }

    /// Create storage, temp and cache directories if missing
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.storage_root, &self.temp_root, &self.cache_dir()] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| DropVaultError::write(dir.as_path(), e))?;
        }
        Ok(())
    }

    pub fn blob_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.storage_root.join(id))
    }

    /// Where the plaintext archive is assembled before finalization
    pub fn temp_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.temp_root.join(format!("{id}.partial")))
    }

    /// Staging name inside the storage root; renamed onto `blob_path` once sealed
    pub fn sealing_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.storage_root.join(format!("{id}.sealing")))
    }

    pub async fn exists(&self, id: &str) -> bool {
        match self.blob_path(id) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Atomically move a finished file onto the durable blob path.
    pub async fn promote(&self, from: &Path, id: &str) -> Result<PathBuf> {
        let to = self.blob_path(id)?;
        fs::rename(from, &to)
            .await
            .map_err(|e| DropVaultError::write(&to, e))?;
        debug!(transfer_id = id, path = %to.display(), "archive blob promoted");
        Ok(to)
    }

    /// Delete the durable blob. Returns `false` if it was already gone.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.blob_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(transfer_id = id, "archive blob deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(transfer_id = id, "archive blob not found during delete");
                Ok(false)
            }
            Err(e) => Err(DropVaultError::write(&path, e)),
        }
    }

    /// Best-effort removal of a caller-owned temporary file.
    pub async fn discard(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "temporary file discarded"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to discard temporary file"),
        }
    }

    /// List durable blobs as (transfer id, size) sorted by id
    pub async fn list_blobs(&self) -> Result<Vec<(String, u64)>> {
        let mut blobs = Vec::new();

        if !fs::try_exists(&self.storage_root).await.unwrap_or(false) {
            return Ok(blobs);
        }

        let mut dir = fs::read_dir(&self.storage_root)
            .await
            .map_err(|e| DropVaultError::read(&self.storage_root, e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| DropVaultError::read(&self.storage_root, e))?
        {
            let name = match entry.file_name().to_str() {
                Some(n) if validate_id(n).is_ok() => n.to_string(),
                _ => continue,
            };
            let meta = entry
                .metadata()
                .await
                .map_err(|e| DropVaultError::read(entry.path(), e))?;
            if meta.is_file() {
                blobs.push((name, meta.len()));
            }
        }

        blobs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> BlobStore {
        BlobStore::new(tmp.path().join("storage"), tmp.path().join("tmp"))
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("3f2a-9c").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc/passwd").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a_b").is_err());
    }

    #[tokio::test]
    async fn test_promote_and_delete() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        blobs.ensure_dirs().await.unwrap();

        let temp = blobs.temp_path("abc").unwrap();
        fs::write(&temp, b"archive").await.unwrap();
        blobs.promote(&temp, "abc").await.unwrap();

        assert!(blobs.exists("abc").await);
        assert!(!temp.exists());
        assert_eq!(blobs.list_blobs().await.unwrap(), vec![("abc".to_string(), 7)]);

        assert!(blobs.delete("abc").await.unwrap());
        assert!(!blobs.exists("abc").await);
        // Idempotent
        assert!(!blobs.delete("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_skips_staging_files() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        blobs.ensure_dirs().await.unwrap();

        fs::write(blobs.sealing_path("x1").unwrap(), b"half").await.unwrap();
        fs::write(blobs.blob_path("x2").unwrap(), b"done").await.unwrap();

        let listed = blobs.list_blobs().await.unwrap();
        assert_eq!(listed, vec![("x2".to_string(), 4)]);
    }
}
