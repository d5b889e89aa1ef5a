use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

pub const DEFAULT_LOCK_CAPACITY: usize = 64;

/// Serializes read-modify-write cycles per storage key. The table is bounded: once it grows past
/// its capacity, entries nobody holds or waits on are evicted.
pub struct KeyedLocks {
    capacity: usize,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_CAPACITY)
    }
}

impl KeyedLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if !locks.contains_key(key) && locks.len() >= self.capacity {
                let before = locks.len();
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
                trace!("Evicted {} idle key locks", before - locks.len());
            }
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::Mutex;

    use super::KeyedLocks;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new(8));
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let (locks, log) = (locks.clone(), log.clone());
            tokio::spawn(async move {
                let _guard = locks.lock("usage:2024-01-01").await;
                log.lock().await.push("first start");
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().await.push("first end");
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let (locks, log) = (locks.clone(), log.clone());
            tokio::spawn(async move {
                let _guard = locks.lock("usage:2024-01-01").await;
                log.lock().await.push("second");
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*log.lock().await, vec!["first start", "first end", "second"]);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new(8);
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_evicted() {
        let locks = KeyedLocks::new(2);
        let held = locks.lock("a").await;
        drop(locks.lock("b").await);
        assert_eq!(locks.len(), 2);

        drop(locks.lock("c").await);
        // "b" was idle and got evicted, "a" is still held.
        assert_eq!(locks.len(), 2);
        drop(held);

        drop(locks.lock("d").await);
        assert_eq!(locks.len(), 1);
    }
}
