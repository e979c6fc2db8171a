//! Per-key async locks that disappear once nobody holds or waits on them.
//!
//! Used by the updater (one update per container id) and by the registry
//! resolver (one fetch per normalized reference). A [`KeyedLock`] handle
//! removes its map entry on drop when it is the last handle, so futures
//! dropped mid-await (timeouts, cancelled scans) never leave entries behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the lock for `key`, creating it if needed.
    pub fn handle<'a>(&'a self, key: &str) -> KeyedLock<'a> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mutex = Arc::clone(entries.entry(key.to_owned()).or_default());
        KeyedLock {
            owner: self,
            key: key.to_owned(),
            mutex,
        }
    }

    /// Number of keys with a live handle.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct KeyedLock<'a> {
    owner: &'a KeyedLocks,
    key: String,
    mutex: Arc<AsyncMutex<()>>,
}

impl KeyedLock<'_> {
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    /// `None` when another handle holds the lock right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.mutex.try_lock().ok()
    }
}

impl Drop for KeyedLock<'_> {
    fn drop(&mut self) {
        let mut entries = self.owner.entries.lock().unwrap_or_else(|p| p.into_inner());
        // map entry + this handle
        let last = entries
            .get(&self.key)
            .is_some_and(|m| Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2);
        if last {
            entries.remove(&self.key);
        }
    }
}
