//! Background retention sweeps.
//!
//! Two independent periodic jobs:
//!
//! - the expired-transfer sweep deletes every transfer whose `expires_at`
//!   has passed, rows first (one transaction per transfer) and the archive
//!   blob afterwards
//! - the cache sweep deletes decrypted copies whose embedded timestamp is at
//!   least one TTL old
//!
//! A failure on one item is logged and counted but never stops the sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::blob_store::BlobStore;
use crate::cache::EphemeralCache;
use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::locks::TransferLocks;
use crate::store::TransferStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    ExpiredTransfers,
    EphemeralCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub kind: SweepKind,
    /// Transfers (or cache files) actually removed
    pub removed: usize,
    /// Items whose removal failed and were skipped
    pub failures: usize,
}

/// What wakes a periodic sweep.
pub enum TickSource {
    Interval(Interval),
    /// Fires once per message; ends when every sender is dropped
    Manual(mpsc::Receiver<()>),
}

impl TickSource {
    /// Fires every `period`, first after one full period.
    pub fn every(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::Interval(interval)
    }

    pub fn manual() -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(8);
        (tx, Self::Manual(rx))
    }

    /// Wait for the next tick. Returns `false` once the source is exhausted.
    pub async fn tick(&mut self) -> bool {
        match self {
            Self::Interval(interval) => {
                interval.tick().await;
                true
            }
            Self::Manual(rx) => rx.recv().await.is_some(),
        }
    }
}

pub struct RetentionScheduler {
    store: TransferStore,
    blobs: BlobStore,
    cache: Arc<EphemeralCache>,
    locks: Arc<TransferLocks>,
    clock: Arc<dyn Clock>,
}

impl RetentionScheduler {
    pub fn new(
        store: TransferStore,
        blobs: BlobStore,
        cache: Arc<EphemeralCache>,
        locks: Arc<TransferLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            blobs,
            cache,
            locks,
            clock,
        }
    }

    /// Delete every expired transfer now.
    ///
    /// Each transfer is re-checked under its lock, so one extended or
    /// deleted since the scan is left alone. A blob that cannot be removed
    /// counts as a failure but its rows stay deleted.
    pub async fn run_expired_sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let ids = self.store.run(move |s| s.expired_transfer_ids(now)).await?;
        debug!(candidates = ids.len(), "expired-transfer sweep started");

        let mut report = SweepReport {
            kind: SweepKind::ExpiredTransfers,
            removed: 0,
            failures: 0,
        };

        for id in ids {
            let _guard = self.locks.acquire(&id).await;

            let row_id = id.clone();
            let deleted = match self
                .store
                .run(move |s| s.delete_transfer_if_expired(&row_id, now))
                .await
            {
                Ok(deleted) => deleted,
                Err(e) => {
                    error!(transfer_id = %id, error = %e, "failed to delete expired transfer rows");
                    report.failures += 1;
                    continue;
                }
            };
            if !deleted {
                continue;
            }
            report.removed += 1;

            if let Err(e) = self.blobs.delete(&id).await {
                warn!(transfer_id = %id, error = %e, "expired transfer removed but blob delete failed");
                report.failures += 1;
            }
        }
        self.locks.prune();

        if report.removed > 0 || report.failures > 0 {
            info!(
                removed = report.removed,
                failures = report.failures,
                "expired-transfer sweep finished"
            );
        } else {
            debug!("expired-transfer sweep: nothing to remove");
        }
        Ok(report)
    }

    /// Run the expired sweep immediately and return how many transfers it deleted.
    pub async fn force_expired_sweep(&self) -> Result<usize> {
        info!("forced expired-transfer sweep");
        Ok(self.run_expired_sweep().await?.removed)
    }

    /// Delete decrypted copies at least one TTL old, whether or not their
    /// transfer still exists. Unrecognised files are ignored.
    pub async fn run_cache_sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport {
            kind: SweepKind::EphemeralCache,
            removed: 0,
            failures: 0,
        };

        for entry in self.cache.entries().await? {
            if !self.cache.is_stale(entry.created_at, now) {
                continue;
            }
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => {
                    debug!(transfer_id = %entry.transfer_id, path = %entry.path.display(), "stale decrypted copy removed");
                    report.removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "failed to remove stale decrypted copy");
                    report.failures += 1;
                }
            }
        }

        if report.removed > 0 || report.failures > 0 {
            info!(
                removed = report.removed,
                failures = report.failures,
                "cache sweep finished"
            );
        }
        Ok(report)
    }

    /// Start both sweeps on their configured intervals.
    pub fn spawn(self: Arc<Self>, config: &RetentionConfig) -> RetentionHandle {
        self.spawn_with(
            TickSource::every(config.expired_sweep_interval()),
            TickSource::every(config.cache_sweep_interval()),
        )
    }

    pub fn spawn_with(self: Arc<Self>, expired: TickSource, cache: TickSource) -> RetentionHandle {
        let (reports, _) = broadcast::channel(16);

        let expired_task = {
            let this = self.clone();
            let reports = reports.clone();
            tokio::spawn(sweep_loop(expired, reports, SweepKind::ExpiredTransfers, move || {
                let this = this.clone();
                async move { this.run_expired_sweep().await }
            }))
        };
        let cache_task = {
            let this = self;
            let reports = reports.clone();
            tokio::spawn(sweep_loop(cache, reports, SweepKind::EphemeralCache, move || {
                let this = this.clone();
                async move { this.run_cache_sweep().await }
            }))
        };

        info!("retention sweeps started");
        RetentionHandle {
            tasks: vec![expired_task, cache_task],
            reports,
        }
    }
}

async fn sweep_loop<F, Fut>(
    mut ticks: TickSource,
    reports: broadcast::Sender<SweepReport>,
    kind: SweepKind,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<SweepReport>>,
{
    while ticks.tick().await {
        match sweep().await {
            Ok(report) => {
                // No subscribers is fine
                let _ = reports.send(report);
            }
            Err(e) => error!(?kind, error = %e, "retention sweep failed"),
        }
    }
    debug!(?kind, "retention tick source closed");
}

/// Running sweeps. Dropping the handle stops them.
pub struct RetentionHandle {
    tasks: Vec<JoinHandle<()>>,
    reports: broadcast::Sender<SweepReport>,
}

impl RetentionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SweepReport> {
        self.reports.subscribe()
    }

    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!("retention sweeps stopped");
    }
}

impl Drop for RetentionHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_millis, ManualClock};
    use crate::model::{FileRecord, Transfer};
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;
    use tokio::fs;

    fn start() -> DateTime<Utc> {
        from_millis(1_700_000_000_000).unwrap()
    }

    struct Fixture {
        _tmp: TempDir,
        store: TransferStore,
        blobs: BlobStore,
        cache: Arc<EphemeralCache>,
        clock: Arc<ManualClock>,
        scheduler: Arc<RetentionScheduler>,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path().join("storage"), tmp.path().join("temp"));
        blobs.ensure_dirs().await.unwrap();
        let store = TransferStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(EphemeralCache::new(
            blobs.cache_dir(),
            chrono::Duration::hours(1),
            clock.clone(),
        ));
        let scheduler = Arc::new(RetentionScheduler::new(
            store.clone(),
            blobs.clone(),
            cache.clone(),
            Arc::new(TransferLocks::new()),
            clock.clone(),
        ));
        Fixture {
            _tmp: tmp,
            store,
            blobs,
            cache,
            clock,
            scheduler,
        }
    }

    async fn add_transfer(f: &Fixture, id: &str, expires_at: Option<DateTime<Utc>>) {
        let transfer = Transfer {
            id: id.to_string(),
            name: format!("name-{id}"),
            created_at: start() - chrono::Duration::days(2),
            expires_at,
            archive_name: format!("{id}.dvar"),
            size_bytes: 3,
            password_hash: None,
            recipient_email: None,
            is_encrypted: false,
            key_source: None,
        };
        let files = [FileRecord {
            transfer_id: id.to_string(),
            original_name: "a.txt".into(),
            size_bytes: 3,
        }];
        f.store.insert_transfer(&transfer, &files).unwrap();
        fs::write(f.blobs.blob_path(id).unwrap(), b"abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_sweep_removes_only_expired() {
        let f = fixture().await;
        let past = Some(start() - chrono::Duration::hours(1));
        let future = Some(start() + chrono::Duration::hours(1));

        for id in ["exp-1", "exp-2", "exp-3"] {
            add_transfer(&f, id, past).await;
        }
        add_transfer(&f, "live-1", future).await;
        add_transfer(&f, "live-2", None).await;

        // A directory cannot be removed as a file, so this blob delete fails
        let stuck = f.blobs.blob_path("exp-3").unwrap();
        fs::remove_file(&stuck).await.unwrap();
        fs::create_dir(&stuck).await.unwrap();

        let report = f.scheduler.run_expired_sweep().await.unwrap();
        assert_eq!(report.removed, 3);
        assert_eq!(report.failures, 1);

        let left: Vec<String> = f
            .store
            .list_transfers()
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"live-1".to_string()));
        assert!(left.contains(&"live-2".to_string()));
        assert!(f.store.list_files("exp-1").unwrap().is_empty());
        assert!(!f.blobs.exists("exp-1").await);
        assert!(f.blobs.exists("live-1").await);

        // Nothing left to delete
        assert_eq!(f.scheduler.force_expired_sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expiry_is_strictly_before_now() {
        let f = fixture().await;
        add_transfer(&f, "edge", Some(start())).await;
        assert_eq!(f.scheduler.force_expired_sweep().await.unwrap(), 0);

        f.clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(f.scheduler.force_expired_sweep().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cache_sweep_removes_stale_and_continues_past_failures() {
        let f = fixture().await;
        let dir = f.cache.dir().to_path_buf();

        let stale = f.cache.entry_path("gone", start() - chrono::Duration::hours(2));
        let edge = f.cache.entry_path("t1", start() - chrono::Duration::hours(1));
        let fresh = f.cache.entry_path("t1", start() - chrono::Duration::minutes(5));
        let leftover = f.cache.staging_path("t2", start() - chrono::Duration::hours(3));
        let foreign = dir.join("readme.txt");
        for p in [&stale, &edge, &fresh, &leftover, &foreign] {
            fs::write(p, b"x").await.unwrap();
        }
        let blocked = f.cache.entry_path("t3", start() - chrono::Duration::hours(4));
        fs::create_dir(&blocked).await.unwrap();

        let report = f.scheduler.run_cache_sweep().await.unwrap();
        assert_eq!(report.kind, SweepKind::EphemeralCache);
        assert_eq!(report.removed, 3);
        assert_eq!(report.failures, 1);

        assert!(!stale.exists() && !edge.exists() && !leftover.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn test_manual_ticks_publish_reports() {
        let f = fixture().await;
        add_transfer(&f, "exp-1", Some(start() - chrono::Duration::hours(1))).await;

        let (expired_tx, expired_ticks) = TickSource::manual();
        let (cache_tx, cache_ticks) = TickSource::manual();
        let handle = f.scheduler.clone().spawn_with(expired_ticks, cache_ticks);
        let mut reports = handle.subscribe();

        expired_tx.send(()).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.kind, SweepKind::ExpiredTransfers);
        assert_eq!(report.removed, 1);

        cache_tx.send(()).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.kind, SweepKind::EphemeralCache);
        assert_eq!(report.removed, 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_waits_one_period() {
        let mut ticks = TickSource::every(Duration::from_secs(3600));
        let first = tokio::time::timeout(Duration::from_secs(3599), ticks.tick()).await;
        assert!(first.is_err());
        assert!(ticks.tick().await);
    }
}
