//! Keyed async mutual exclusion
//!
//! One `tokio` mutex per key, created on first use. Guards are owned, so
//! they can be held across `.await` points and moved between tasks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Clone)]
pub(crate) struct KeyedLocks<K> {
    inner: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Copy + Eq + Hash> KeyedLocks<K> {
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock of a key that no longer exists
    pub fn forget(&self, key: K) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_waits_other_keys_do_not() {
        let locks: KeyedLocks<u64> = KeyedLocks::default();
        let held = locks.lock(1).await;

        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.lock(1))
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.lock(2))
                .await
                .is_ok()
        );

        drop(held);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.lock(1))
                .await
                .is_ok()
        );
    }
}
