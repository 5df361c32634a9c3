//! # Keyed Locks
//!
//! One async mutex per key, created on demand.
//!
//! ```text
//! lock(id_1) ──► [Mutex id_1] ◄── lock(id_1)   second caller waits
//! lock(id_2) ──► [Mutex id_2]                  runs in parallel
//! ```
//!
//! Entries nobody holds are pruned once the map grows past a threshold.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

/// Guard returned by [`KeyedLocks::lock`]; the key is released on drop.
pub type KeyedGuard = OwnedMutexGuard<()>;

/// Per-key async mutexes.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    inner: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        KeyedLocks {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free and holds it until the guard drops.
    pub async fn lock(&self, key: &K) -> KeyedGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            map.entry(key.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let guard = locks.lock(&1).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&1).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(&1).await;
        let _b = locks.lock(&2).await;
        assert_eq!(locks.len(), 2);
    }
}
