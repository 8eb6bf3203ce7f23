//! High-level transfer operations.
//!
//! This module provides [`Vault`], the primary interface tying the pipeline
//! together:
//!
//! - `create_transfer`: archive the files, seal the archive, promote it into
//!   storage, then record the transfer rows
//! - `open_download`: serve a fresh ephemeral decrypted copy, decrypting
//!   again once the previous copy has reached its TTL
//! - `delete_transfer`: remove rows, then the sealed blob
//!
//! Creates, downloads and deletes of the same transfer are serialized
//! through [`TransferLocks`], so a download never decrypts a blob that is
//! being removed; it reports the transfer as gone instead. Each operation
//! prunes the lock registry once its guard is released.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveSource, Archiver};
use crate::blob_store::{validate_id, BlobStore};
use crate::cache::EphemeralCache;
use crate::cipher::CipherEngine;
use crate::clock::Clock;
use crate::config::{CipherConfig, Config};
use crate::error::{DropVaultError, Result};
use crate::keys::{hash_password, verify_password, TransferContext};
use crate::locks::TransferLocks;
use crate::model::{AccessAction, FileRecord, Transfer};
use crate::retention::RetentionScheduler;
use crate::store::TransferStore;

/// Archive file extension used for download names
pub const ARCHIVE_EXT: &str = "dvar";

#[derive(Debug, Clone, Default)]
pub struct NewTransfer {
    /// Caller-chosen id; a UUID v4 is generated when `None`
    pub id: Option<String>,
    pub name: String,
    pub files: Vec<ArchiveSource>,
    pub expires_at: Option<DateTime<Utc>>,
    pub recipient_email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug)]
pub struct Download {
    pub transfer: Transfer,
    /// Decrypted archive inside the ephemeral cache
    pub path: PathBuf,
    pub cache_hit: bool,
}

pub struct Vault {
    blobs: BlobStore,
    store: TransferStore,
    archiver: Archiver,
    cipher: CipherEngine,
    cache: Arc<EphemeralCache>,
    locks: Arc<TransferLocks>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl Vault {
    /// Open the database named in `config` and build every component from it.
    pub async fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let db_path = PathBuf::from(&config.database_path);
        let store = tokio::task::spawn_blocking(move || TransferStore::open(&db_path)).await??;
        let vault = Self::new(config, store, clock);
        vault.blobs.ensure_dirs().await?;
        Ok(vault)
    }

    pub fn new(config: &Config, store: TransferStore, clock: Arc<dyn Clock>) -> Self {
        let blobs = BlobStore::new(&config.storage_dir, &config.temp_dir);
        let archiver = Archiver::new(blobs.clone()).with_compression(config.archive.compress);
        let cipher = CipherEngine::new(config.encryption.clone(), clock.clone());
        let cache = Arc::new(EphemeralCache::new(
            blobs.cache_dir(),
            config.retention.cache_ttl(),
            clock.clone(),
        ));

        Self {
            blobs,
            store,
            archiver,
            cipher,
            cache,
            locks: Arc::new(TransferLocks::new()),
            clock,
            batch_size: config.archive.batch_size,
        }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn store(&self) -> &TransferStore {
        &self.store
    }

    pub fn cache(&self) -> &EphemeralCache {
        &self.cache
    }

    /// A retention scheduler sharing this vault's store, blobs, cache and locks.
    pub fn retention(&self) -> RetentionScheduler {
        RetentionScheduler::new(
            self.store.clone(),
            self.blobs.clone(),
            self.cache.clone(),
            self.locks.clone(),
            self.clock.clone(),
        )
    }

    /// Archive, seal and record a new transfer.
    ///
    /// `size_bytes` on the returned transfer is the plaintext archive size.
    /// Every temporary file is discarded on failure.
    pub async fn create_transfer(&self, req: NewTransfer) -> Result<Transfer> {
        if req.files.is_empty() {
            return Err(DropVaultError::config("a transfer needs at least one file"));
        }

        let (id, chosen) = match &req.id {
            Some(id) => {
                validate_id(id)?;
                (id.clone(), true)
            }
            None => (Uuid::new_v4().to_string(), false),
        };

        let guard = self.locks.acquire(&id).await;
        let result = self.create_locked(id, chosen, req).await;
        drop(guard);
        self.locks.prune();
        result
    }

    async fn create_locked(&self, id: String, chosen: bool, req: NewTransfer) -> Result<Transfer> {
        if chosen {
            let lookup_id = id.clone();
            let row = self.store.run(move |s| s.get_transfer(&lookup_id)).await?;
            if row.is_some() || self.blobs.exists(&id).await {
                return Err(DropVaultError::DuplicateTransferId(id));
            }
        }

        let created_at = self.clock.now();
        self.blobs.ensure_dirs().await?;

        info!(transfer_id = %id, name = %req.name, files = req.files.len(), "creating transfer");

        let outcome = match self
            .archiver
            .build_archive(&id, &req.files, self.batch_size)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                if let Ok(temp) = self.blobs.temp_path(&id) {
                    self.blobs.discard(&temp).await;
                }
                error!(transfer_id = %id, error = %e, "archive build failed");
                return Err(e);
            }
        };

        if outcome.entries_written == 0 {
            self.blobs.discard(&outcome.temp_path).await;
            let first = outcome.skipped.into_iter().next().unwrap_or_default();
            return Err(DropVaultError::SourceFileMissing(first));
        }

        let ctx = TransferContext {
            name: req.name.clone(),
            recipient_email: req.recipient_email.clone(),
            password: req.password.clone(),
            created_at: Some(created_at),
        };

        let encrypted = self.cipher.config().enabled;
        let sealed = if encrypted {
            let sealing = self.blobs.sealing_path(&id)?;
            let sealed = self.cipher.encrypt(&outcome.temp_path, &sealing, &ctx).await;
            self.blobs.discard(&outcome.temp_path).await;
            match sealed {
                Ok(_) => self.blobs.promote(&sealing, &id).await,
                Err(e) => {
                    self.blobs.discard(&sealing).await;
                    Err(e)
                }
            }
        } else {
            // Disabled cipher: the plaintext archive itself becomes the durable blob
            self.blobs.promote(&outcome.temp_path, &id).await
        };
        if let Err(e) = sealed {
            error!(transfer_id = %id, error = %e, "sealing archive failed");
            return Err(e);
        }

        let password_hash = match req.password.as_deref().filter(|p| !p.is_empty()) {
            Some(pw) => {
                let pw = pw.to_owned();
                Some(tokio::task::spawn_blocking(move || hash_password(&pw)).await??)
            }
            None => None,
        };

        let transfer = Transfer {
            id: id.clone(),
            name: req.name.clone(),
            created_at,
            expires_at: req.expires_at,
            archive_name: format!("{}.{ARCHIVE_EXT}", archive_stem(&req.name)),
            size_bytes: outcome.bytes_written,
            password_hash,
            recipient_email: req.recipient_email.clone(),
            is_encrypted: encrypted,
            key_source: encrypted.then(|| self.cipher.key_source()),
        };

        let files: Vec<FileRecord> = req
            .files
            .iter()
            .filter(|f| !outcome.skipped.contains(&f.source_path))
            .map(|f| FileRecord {
                transfer_id: id.clone(),
                original_name: f.destination_name.clone(),
                size_bytes: f.size,
            })
            .collect();

        let row = transfer.clone();
        if let Err(e) = self.store.run(move |s| s.insert_transfer(&row, &files)).await {
            error!(transfer_id = %id, error = %e, "recording transfer failed, removing blob");
            if let Err(cleanup) = self.blobs.delete(&id).await {
                warn!(transfer_id = %id, error = %cleanup, "failed to remove orphaned blob");
            }
            return Err(e);
        }

        info!(
            transfer_id = %id,
            entries = outcome.entries_written,
            skipped = outcome.skipped.len(),
            bytes = outcome.bytes_written,
            encrypted,
            "transfer created"
        );
        Ok(transfer)
    }

    /// Serve a decrypted copy of the transfer's archive.
    ///
    /// A cache entry younger than the TTL is reused verbatim; otherwise the
    /// blob is decrypted into a new entry stamped with the current time.
    /// A transfer created with a password refuses every download, cached or
    /// not, unless that password is supplied.
    pub async fn open_download(&self, id: &str, password: Option<String>) -> Result<Download> {
        validate_id(id)?;
        let guard = self.locks.acquire(id).await;
        let result = self.download_locked(id, password).await;
        drop(guard);
        self.locks.prune();
        result
    }

    async fn download_locked(&self, id: &str, password: Option<String>) -> Result<Download> {
        let lookup_id = id.to_string();
        let transfer = self
            .store
            .run(move |s| s.get_transfer(&lookup_id))
            .await?
            .ok_or_else(|| DropVaultError::TransferNotFound(id.to_string()))?;

        // Checked before the cache so a wrong password never reads or seeds an entry
        if let Some(hash) = transfer.password_hash.clone() {
            let supplied = password.clone().unwrap_or_default();
            let accepted =
                tokio::task::spawn_blocking(move || verify_password(&hash, &supplied)).await?;
            if !accepted {
                warn!(transfer_id = id, "download refused: wrong or missing password");
                return Err(DropVaultError::WrongPassword(id.to_string()));
            }
        }

        if !self.blobs.exists(id).await {
            warn!(transfer_id = id, "transfer row present but blob is gone");
            return Err(DropVaultError::TransferNotFound(id.to_string()));
        }

        if let Some(entry) = self.cache.lookup(id).await? {
            debug!(transfer_id = id, path = %entry.path.display(), "serving cached decrypted archive");
            self.record(id, AccessAction::CacheHit).await;
            return Ok(Download {
                transfer,
                path: entry.path,
                cache_hit: true,
            });
        }

        fs::create_dir_all(self.cache.dir())
            .await
            .map_err(|e| DropVaultError::write(self.cache.dir(), e))?;

        let created_at = self.clock.now();
        let staging = self.cache.staging_path(id, created_at);
        let entry = self.cache.entry_path(id, created_at);
        let blob = self.blobs.blob_path(id)?;

        let engine = self.engine_for(&transfer);
        let ctx = transfer.context(password);
        if let Err(e) = engine.decrypt(&blob, &staging, &ctx).await {
            self.blobs.discard(&staging).await;
            error!(transfer_id = id, error = %e, "decrypting archive failed");
            return Err(e);
        }
        fs::rename(&staging, &entry)
            .await
            .map_err(|e| DropVaultError::write(&entry, e))?;

        self.record(id, AccessAction::Download).await;
        info!(transfer_id = id, path = %entry.display(), "archive decrypted for download");

        Ok(Download {
            transfer,
            path: entry,
            cache_hit: false,
        })
    }

    /// Delete a transfer's rows and blob. Returns `false` if it did not exist.
    ///
    /// Rows go first in one transaction; the blob delete afterwards is
    /// best-effort. Lingering ephemeral copies are left to the cache sweep.
    pub async fn delete_transfer(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let guard = self.locks.acquire(id).await;
        let result = self.delete_locked(id).await;
        drop(guard);
        self.locks.prune();
        result
    }

    async fn delete_locked(&self, id: &str) -> Result<bool> {
        let delete_id = id.to_string();
        let deleted = self.store.run(move |s| s.delete_transfer(&delete_id)).await?;
        if !deleted {
            debug!(transfer_id = id, "delete requested for unknown transfer");
            return Ok(false);
        }

        if let Err(e) = self.blobs.delete(id).await {
            warn!(transfer_id = id, error = %e, "transfer rows deleted but blob removal failed");
        }
        info!(transfer_id = id, "transfer deleted");
        Ok(true)
    }

    pub async fn get_transfer(&self, id: &str) -> Result<Option<Transfer>> {
        let id = id.to_string();
        self.store.run(move |s| s.get_transfer(&id)).await
    }

    pub async fn list_transfers(&self) -> Result<Vec<Transfer>> {
        self.store.run(|s| s.list_transfers()).await
    }

    pub async fn list_files(&self, id: &str) -> Result<Vec<FileRecord>> {
        let id = id.to_string();
        self.store.run(move |s| s.list_files(&id)).await
    }

    /// Decrypt with the policy the transfer was sealed under, not the current config.
    fn engine_for(&self, transfer: &Transfer) -> CipherEngine {
        let current = self.cipher.config();
        let config = CipherConfig {
            enabled: transfer.is_encrypted,
            key_source: transfer.key_source.unwrap_or(current.key_source),
            manual_key: current.manual_key.clone(),
            large_threshold_bytes: current.large_threshold_bytes,
        };
        CipherEngine::new(config, self.clock.clone())
    }

    async fn record(&self, id: &str, action: AccessAction) {
        let at = self.clock.now();
        let log_id = id.to_string();
        if let Err(e) = self.store.run(move |s| s.record_access(&log_id, action, at)).await {
            warn!(transfer_id = id, error = %e, "failed to record access");
        }
    }
}

/// File-system friendly stem for the download name.
fn archive_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let stem = stem.trim_matches('_');
    if stem.is_empty() {
        "transfer".to_string()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_stem() {
        assert_eq!(archive_stem("Project X"), "Project_X");
        assert_eq!(archive_stem("../../etc"), "etc");
        assert_eq!(archive_stem("!!!"), "transfer");
    }

    #[tokio::test]
    async fn test_operations_leave_no_lock_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(
            tmp.path().join("storage").to_string_lossy(),
            tmp.path().join("tmp").to_string_lossy(),
            tmp.path().join("db.sqlite").to_string_lossy(),
        );
        let store = TransferStore::open_in_memory().unwrap();
        let vault = Vault::new(&cfg, store, Arc::new(crate::clock::SystemClock));

        let src = tmp.path().join("a.txt");
        fs::write(&src, b"payload").await.unwrap();
        let transfer = vault
            .create_transfer(NewTransfer {
                name: "locks".into(),
                files: vec![ArchiveSource::new(&src, "a.txt", 7)],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(vault.locks.is_empty());

        vault.open_download(&transfer.id, None).await.unwrap();
        assert!(vault.locks.is_empty());

        assert!(vault.delete_transfer(&transfer.id).await.unwrap());
        assert!(vault.locks.is_empty());

        // Failed operations prune too
        assert!(vault.open_download(&transfer.id, None).await.is_err());
        assert!(!vault.delete_transfer(&transfer.id).await.unwrap());
        assert!(vault.locks.is_empty());
    }
}
