//! Per-rollback-point execution locks.
//!
//! Every mutation of a rollback point (restore, capture, removal, expiry)
//! holds the point's lock. Waiters are served in FIFO order; a restore uses
//! [`ExecutionLocks::try_acquire`] and fails fast instead of queueing.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::RollbackPointId;

/// Held for the duration of a mutation; released on drop.
#[derive(Debug)]
pub struct ExecutionGuard {
    rollback_point_id: RollbackPointId,
    _guard: OwnedMutexGuard<()>,
}

impl ExecutionGuard {
    pub fn rollback_point_id(&self) -> &str {
        &self.rollback_point_id
    }
}

#[derive(Debug, Default)]
pub struct ExecutionLocks {
    locks: Mutex<HashMap<RollbackPointId, Arc<Mutex<()>>>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for the lock of `id`.
    pub async fn acquire(&self, id: &str) -> ExecutionGuard {
        let lock = self.entry(id).await;
        ExecutionGuard {
            rollback_point_id: id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Take the lock of `id` only if nobody holds it.
    pub async fn try_acquire(&self, id: &str) -> Option<ExecutionGuard> {
        let lock = self.entry(id).await;
        let guard = lock.try_lock_owned().ok()?;
        Some(ExecutionGuard {
            rollback_point_id: id.to_string(),
            _guard: guard,
        })
    }

    pub async fn is_held(&self, id: &str) -> bool {
        let locks = self.locks.lock().await;
        locks.get(id).is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Drop entries nobody holds or waits on. Returns the number removed.
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_acquire_fails_while_held() {
        let locks = ExecutionLocks::new();
        let guard = locks.try_acquire("rp-1").await.expect("first acquire");
        assert_eq!(guard.rollback_point_id(), "rp-1");

        assert!(locks.try_acquire("rp-1").await.is_none());
        assert!(locks.is_held("rp-1").await);
        // Other points are independent
        assert!(locks.try_acquire("rp-2").await.is_some());

        drop(guard);
        assert!(!locks.is_held("rp-1").await);
        assert!(locks.try_acquire("rp-1").await.is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = Arc::new(ExecutionLocks::new());
        let guard = locks.acquire("rp").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("rp").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = ExecutionLocks::new();
        let _held = locks.acquire("held").await;
        drop(locks.acquire("idle").await);

        assert_eq!(locks.prune().await, 1);
        assert!(locks.is_held("held").await);
    }
}
