//! Per-entity serialization of the ingest path.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per entity key, created on first use.
///
/// Ingest for different entities proceeds in parallel; two events for the
/// same entity are clocked, stored and published one after the other.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
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
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(EntityLocks::new());
        let guard = locks.acquire("user:1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("user:1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _different = locks.acquire("user:2").await;
        drop(guard);
        waiter.await.unwrap();
    }

    #[test]
    fn test_waiter_is_woken_on_release() {
        use tokio_test::{assert_pending, assert_ready, task};

        let locks = EntityLocks::new();
        let guard = assert_ready!(task::spawn(locks.acquire("trade:7")).poll());

        let mut waiter = task::spawn(locks.acquire("trade:7"));
        assert_pending!(waiter.poll());

        drop(guard);
        assert!(waiter.is_woken());
        let _guard = assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = EntityLocks::new();
        let held = locks.acquire("user:1").await;
        drop(locks.acquire("user:2").await);

        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
