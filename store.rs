//! Transfer metadata storage (SQLite).
//!
//! Tables:
//! - `transfers`: one row per transfer (timestamps as unix milliseconds)
//! - `files`: the files bundled into each transfer's archive
//! - `transfer_stats`: download counter per transfer
//! - `access_logs`: append-only download log
//!
//! Every statement is parameterized. Deleting a transfer removes its child
//! rows and the transfer row inside one transaction.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::clock::from_millis;
use crate::error::{DropVaultError, Result};
use crate::keys::KeySource;
use crate::model::{AccessAction, FileRecord, Transfer, TransferStats};

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE transfers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    archive_name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    password_hash TEXT,
    recipient_email TEXT,
    is_encrypted INTEGER NOT NULL DEFAULT 0,
    key_source TEXT
);

CREATE INDEX idx_transfers_expires_at ON transfers(expires_at);

CREATE TABLE files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transfer_id TEXT NOT NULL,
    original_name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    FOREIGN KEY (transfer_id) REFERENCES transfers(id)
);

CREATE INDEX idx_files_transfer ON files(transfer_id);

CREATE TABLE transfer_stats (
    transfer_id TEXT PRIMARY KEY,
    download_count INTEGER NOT NULL DEFAULT 0,
    last_download_at INTEGER,
    FOREIGN KEY (transfer_id) REFERENCES transfers(id)
);

CREATE TABLE access_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transfer_id TEXT NOT NULL,
    accessed_at INTEGER NOT NULL,
    action TEXT NOT NULL,
    FOREIGN KEY (transfer_id) REFERENCES transfers(id)
);

CREATE INDEX idx_access_logs_transfer ON access_logs(transfer_id);
",
    )])
}

/// Shared handle to the transfer database.
///
/// rusqlite is synchronous; the connection sits behind `Arc<Mutex>` and async
/// callers go through [`TransferStore::run`], which hops onto the blocking pool.
#[derive(Clone)]
pub struct TransferStore {
    conn: Arc<Mutex<Connection>>,
}

impl TransferStore {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DropVaultError::write(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "transfer store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations()
            .to_latest(&mut conn)
            .map_err(|e| DropVaultError::Schema(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DropVaultError::Task(format!("database lock poisoned: {e}")))
    }

    /// Run a blocking store operation from async code.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TransferStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Insert a transfer, its files and an empty stats row atomically.
    pub fn insert_transfer(&self, transfer: &Transfer, files: &[FileRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO transfers (id, name, created_at, expires_at, archive_name, size_bytes,
                                    password_hash, recipient_email, is_encrypted, key_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                transfer.id,
                transfer.name,
                transfer.created_at.timestamp_millis(),
                transfer.expires_at.map(|t| t.timestamp_millis()),
                transfer.archive_name,
                transfer.size_bytes as i64,
                transfer.password_hash,
                transfer.recipient_email,
                transfer.is_encrypted,
                transfer.key_source.map(|k| k.as_str()),
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO files (transfer_id, original_name, size_bytes) VALUES (?1, ?2, ?3)",
            )?;
            for file in files {
                stmt.execute(params![transfer.id, file.original_name, file.size_bytes as i64])?;
            }
        }
        tx.execute(
            "INSERT INTO transfer_stats (transfer_id, download_count) VALUES (?1, 0)",
            params![transfer.id],
        )?;
        tx.commit()?;

        debug!(transfer_id = %transfer.id, files = files.len(), "transfer row inserted");
        Ok(())
    }

    pub fn get_transfer(&self, id: &str) -> Result<Option<Transfer>> {
        let conn = self.conn()?;
        let transfer = conn
            .query_row(
                "SELECT id, name, created_at, expires_at, archive_name, size_bytes,
                        password_hash, recipient_email, is_encrypted, key_source
                 FROM transfers WHERE id = ?1",
                params![id],
                row_to_transfer,
            )
            .optional()?;
        Ok(transfer)
    }

    /// All transfers, oldest first
    pub fn list_transfers(&self) -> Result<Vec<Transfer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at, expires_at, archive_name, size_bytes,
                    password_hash, recipient_email, is_encrypted, key_source
             FROM transfers ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], row_to_transfer)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_files(&self, transfer_id: &str) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT transfer_id, original_name, size_bytes FROM files
             WHERE transfer_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![transfer_id], |row| {
            Ok(FileRecord {
                transfer_id: row.get(0)?,
                original_name: row.get(1)?,
                size_bytes: row.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Append an access log row and bump the download counter.
    pub fn record_access(&self, transfer_id: &str, action: AccessAction, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO access_logs (transfer_id, accessed_at, action) VALUES (?1, ?2, ?3)",
            params![transfer_id, at.timestamp_millis(), action.as_str()],
        )?;
        tx.execute(
            "UPDATE transfer_stats
             SET download_count = download_count + 1, last_download_at = ?2
             WHERE transfer_id = ?1",
            params![transfer_id, at.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn stats(&self, transfer_id: &str) -> Result<Option<TransferStats>> {
        let conn = self.conn()?;
        let stats = conn
            .query_row(
                "SELECT download_count, last_download_at FROM transfer_stats WHERE transfer_id = ?1",
                params![transfer_id],
                |row| {
                    Ok(TransferStats {
                        download_count: row.get::<_, i64>(0)? as u64,
                        last_download_at: opt_time(row, 1)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    pub fn access_log_count(&self, transfer_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM access_logs WHERE transfer_id = ?1",
            params![transfer_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Ids of transfers whose `expires_at` is set and earlier than `now`.
    pub fn expired_transfer_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM transfers
             WHERE expires_at IS NOT NULL AND expires_at < ?1
             ORDER BY expires_at",
        )?;
        let rows = stmt.query_map(params![now.timestamp_millis()], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a transfer and all its child rows. Returns `false` if no such transfer.
    pub fn delete_transfer(&self, id: &str) -> Result<bool> {
        self.delete_where(id, None)
    }

    /// Delete a transfer only if it is still expired at `now`; all-or-nothing.
    pub fn delete_transfer_if_expired(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.delete_where(id, Some(now))
    }

    fn delete_where(&self, id: &str, expired_before: Option<DateTime<Utc>>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let found: Option<Option<i64>> = tx
            .query_row(
                "SELECT expires_at FROM transfers WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let eligible = match (found, expired_before) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(Some(expires_at)), Some(now)) => expires_at < now.timestamp_millis(),
            (Some(None), Some(_)) => false,
        };
        if !eligible {
            // Nothing written; dropping the transaction rolls back
            return Ok(false);
        }

        tx.execute("DELETE FROM files WHERE transfer_id = ?1", params![id])?;
        tx.execute("DELETE FROM transfer_stats WHERE transfer_id = ?1", params![id])?;
        tx.execute("DELETE FROM access_logs WHERE transfer_id = ?1", params![id])?;
        tx.execute("DELETE FROM transfers WHERE id = ?1", params![id])?;
        tx.commit()?;

        debug!(transfer_id = id, "transfer rows deleted");
        Ok(true)
    }
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    from_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, "timestamp out of range".into())
    })
}

fn opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        None => Ok(None),
        Some(_) => time_at(row, idx).map(Some),
    }
}

fn row_to_transfer(row: &Row<'_>) -> rusqlite::Result<Transfer> {
    let key_source = match row.get::<_, Option<String>>(9)? {
        None => None,
        Some(s) => Some(
            s.parse::<KeySource>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?,
        ),
    };

    Ok(Transfer {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: time_at(row, 2)?,
        expires_at: opt_time(row, 3)?,
        archive_name: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)? as u64,
        password_hash: row.get(6)?,
        recipient_email: row.get(7)?,
        is_encrypted: row.get(8)?,
        key_source,
    })
}
