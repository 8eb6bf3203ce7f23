//! Per-transfer mutual exclusion.
//!
//! Decrypt-for-download and delete (explicit or by the expiry sweep) take the
//! same per-id lock, so a download either completes before the archive is
//! removed or observes the transfer as gone.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct TransferLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TransferLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `transfer_id`.
    pub async fn acquire(&self, transfer_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(transfer_id.to_string())
            .or_default()
            .clone();
        // The map shard guard is released above, before awaiting
        lock.lock_owned().await
    }

    /// Drop registry entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
