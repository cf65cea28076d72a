//! Async mutexes keyed by transfer id or domain.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug)]
pub(crate) struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Waits for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(
            self.locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        mutex.lock_owned().await
    }

    /// Drops the entry for a key that will not be locked again.
    pub(crate) fn forget(&self, key: &K) {
        self.locks.remove(key);
    }
}
