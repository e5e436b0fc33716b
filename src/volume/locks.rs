//! Per-Volume Locks
//!
//! One FIFO async mutex per volume id. `tokio::sync::Mutex` grants the lock
//! in request order, which gives per-id serialization without a global lock.

use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What a caller does when the volume lock is already held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Wait in FIFO order
    #[default]
    Queue,
    /// Fail fast with `ConflictingOperation`
    Reject,
}

/// Guard held while a volume's bookkeeping is mutated
pub type VolumeGuard = OwnedMutexGuard<()>;

/// Lock table keyed by volume id
#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    mode: LockMode,
}

impl VolumeLocks {
    pub fn new(mode: LockMode) -> Self {
        Self {
            locks: DashMap::new(),
            mode,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    fn slot(&self, volume_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire according to the configured mode
    pub async fn acquire(&self, volume_id: &str) -> Result<VolumeGuard> {
        match self.mode {
            LockMode::Queue => Ok(self.slot(volume_id).lock_owned().await),
            LockMode::Reject => self.try_acquire(volume_id),
        }
    }

    /// Always wait, regardless of mode; used to finalize an operation
    /// that already holds the transitional status
    pub async fn lock(&self, volume_id: &str) -> VolumeGuard {
        self.slot(volume_id).lock_owned().await
    }

    /// Acquire without waiting
    pub fn try_acquire(&self, volume_id: &str) -> Result<VolumeGuard> {
        self.slot(volume_id)
            .try_lock_owned()
            .map_err(|_| Error::ConflictingOperation {
                volume_id: volume_id.to_string(),
                status: "locked".to_string(),
            })
    }

    /// Drop the slot of a volume that no longer exists.
    ///
    /// A slot that is still referenced by a waiter is kept.
    pub fn forget(&self, volume_id: &str) {
        self.locks
            .remove_if(volume_id, |_, slot| Arc::strong_count(slot) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_mode_is_fifo() {
        let locks = Arc::new(VolumeLocks::new(LockMode::Queue));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = locks.acquire("vol-1").await.unwrap();
        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("vol-1").await.unwrap();
                order.lock().push(i);
            }));
            // Each waiter is queued before the next one is spawned
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reject_mode() {
        let locks = VolumeLocks::new(LockMode::Reject);
        let guard = locks.acquire("vol-1").await.unwrap();
        assert_matches!(
            locks.acquire("vol-1").await,
            Err(Error::ConflictingOperation { .. })
        );
        // Other ids are independent
        assert!(locks.acquire("vol-2").await.is_ok());
        drop(guard);
        assert!(locks.acquire("vol-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_forget_keeps_held_slot() {
        let locks = VolumeLocks::new(LockMode::Queue);
        let guard = locks.acquire("vol-1").await.unwrap();
        locks.forget("vol-1");
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.forget("vol-1");
        assert!(locks.is_empty());
    }
}
