//! Per-key mutual exclusion.
//!
//! [`KeyMutex`] hands out one async lock per string key.  Holders of
//! different keys never wait on each other.  Entries are dropped from the map
//! as soon as nobody holds or waits for them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// A map of independent async mutexes keyed by string.
#[derive(Debug, Default)]
pub struct KeyMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyMutex {
    /// Create an empty key mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    ///
    /// The lock is released when the returned guard is dropped.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = Arc::clone(&self.locks.entry(key.to_owned()).or_default());
        let guard = mutex.lock_owned().await;
        trace!(key, "key lock acquired");
        KeyGuard {
            owner: self,
            key: key.to_owned(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key is held or waited on.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Guard for one key of a [`KeyMutex`].
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'a> {
    owner: &'a KeyMutex,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard<'_> {
    /// Key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: no holder and no waiter.
        self.owner
            .locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
        trace!(key = %self.key, "key lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyMutex::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            handles.push(tokio::spawn(async move {
                let _g = locks.lock("disk-1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyMutex::new();
        let _a = locks.lock("disk-a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("disk-b")).await;
        assert!(b.is_ok(), "lock on a different key must not wait");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn released_on_drop() {
        let locks = KeyMutex::new();
        {
            let g = locks.lock("disk-1").await;
            assert_eq!(g.key(), "disk-1");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
        let again = tokio::time::timeout(Duration::from_secs(1), locks.lock("disk-1")).await;
        assert!(again.is_ok());
    }
}
