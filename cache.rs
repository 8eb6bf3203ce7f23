//! Ephemeral decrypted copies.
//!
//! A download decrypts the sealed archive into `temp_root/decrypted` under a
//! name that encodes the transfer id and creation time:
//!
//! ```text
//! {transfer_id}_{created_unix_millis}.dec
//! ```
//!
//! so freshness can be judged from the file name alone. Entries are never
//! authoritative and may be recomputed at any time. Lookups never delete
//! stale entries; the retention sweep does.

use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::clock::{from_millis, Clock};
use crate::error::{DropVaultError, Result};

const ENTRY_EXT: &str = "dec";
const STAGING_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub transfer_id: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    /// Left behind by a decrypt that never completed; never served
    pub staging: bool,
}

/// Parse `{id}_{millis}.dec` into its id and timestamp.
pub fn parse_entry_name(name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = name.strip_suffix(ENTRY_EXT)?.strip_suffix('.')?;
    let (id, millis) = stem.rsplit_once('_')?;
    if id.is_empty() {
        return None;
    }
    let created = from_millis(millis.parse().ok()?)?;
    Some((id.to_string(), created))
}

pub struct EphemeralCache {
    dir: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl EphemeralCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, transfer_id: &str, created_at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{transfer_id}_{}.{ENTRY_EXT}",
            created_at.timestamp_millis()
        ))
    }

    /// Where an entry is written before being renamed into place
    pub fn staging_path(&self, transfer_id: &str, created_at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{transfer_id}_{}.{ENTRY_EXT}{STAGING_SUFFIX}",
            created_at.timestamp_millis()
        ))
    }

    /// An entry is stale once its age reaches the TTL.
    pub fn is_stale(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - created_at >= self.ttl
    }

    /// All well-formed entries (including staging leftovers) in no particular order.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut out = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(DropVaultError::read(&self.dir, e)),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| DropVaultError::read(&self.dir, e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let (base, staging) = match name.strip_suffix(STAGING_SUFFIX) {
                Some(base) => (base, true),
                None => (name, false),
            };
            match parse_entry_name(base) {
                Some((transfer_id, created_at)) => out.push(CacheEntry {
                    transfer_id,
                    created_at,
                    path: entry.path(),
                    staging,
                }),
                None => debug!(file = name, "ignoring unrecognised cache file"),
            }
        }
        Ok(out)
    }

    /// Newest entry for `transfer_id` that is still younger than the TTL.
    pub async fn lookup(&self, transfer_id: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now();
        let fresh = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| {
                !e.staging && e.transfer_id == transfer_id && !self.is_stale(e.created_at, now)
            })
            .max_by_key(|e| e.created_at);
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn start() -> DateTime<Utc> {
        from_millis(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_entry_name_round_trip() {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = EphemeralCache::new("/cache", Duration::hours(1), clock);
        let path = cache.entry_path("ab-12", start());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "ab-12_1700000000000.dec");
        assert_eq!(parse_entry_name(name), Some(("ab-12".to_string(), start())));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_entry_name("notes.txt"), None);
        assert_eq!(parse_entry_name("abc.dec"), None);
        assert_eq!(parse_entry_name("_123.dec"), None);
        assert_eq!(parse_entry_name("abc_xyz.dec"), None);
        assert_eq!(parse_entry_name("abc_123.dec.partial"), None);
    }

    #[test]
    fn test_staleness_boundary() {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = EphemeralCache::new("/cache", Duration::hours(1), clock);
        let t = start();
        assert!(!cache.is_stale(t, t + Duration::minutes(59)));
        assert!(cache.is_stale(t, t + Duration::hours(1)));
        assert!(cache.is_stale(t, t + Duration::hours(2)));
    }

    #[tokio::test]
    async fn test_lookup_prefers_newest_fresh_entry() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let cache = EphemeralCache::new(tmp.path(), Duration::hours(1), clock.clone());

        let old = cache.entry_path("t1", start() - Duration::hours(3));
        let newer = cache.entry_path("t1", start() - Duration::minutes(10));
        let other = cache.entry_path("t2", start());
        let half = cache.staging_path("t1", start());
        for p in [&old, &newer, &other, &half] {
            fs::write(p, b"x").await.unwrap();
        }

        let hit = cache.lookup("t1").await.unwrap().unwrap();
        assert_eq!(hit.path, newer);
        assert_eq!(cache.entries().await.unwrap().len(), 4);

        clock.advance(Duration::minutes(50));
        assert!(cache.lookup("t1").await.unwrap().is_none());
        // Lookup leaves stale files alone
        assert!(old.exists() && newer.exists());
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let cache = EphemeralCache::new(tmp.path().join("nope"), Duration::hours(1), clock);
        assert!(cache.entries().await.unwrap().is_empty());
    }
}
