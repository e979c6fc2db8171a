//! In-process TTL cache of index digests, keyed by normalized reference.
//!
//! Entries are stamped with [`tokio::time::Instant`] so paused-clock tests
//! can drive expiry with `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    digest: String,
    stored_at: Instant,
    expires_at: Instant,
}

/// Digest cache shared by all resolver calls.
#[derive(Debug, Default)]
pub struct DigestCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the digest for `key` if it has not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.digest.clone())
    }

    /// Returns the digest for `key` only if it was stored at or after `since`.
    ///
    /// Used after waiting behind an in-flight fetch to pick up its result.
    pub fn get_stored_since(&self, key: &str, since: Instant) -> Option<String> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .get(key)
            .filter(|e| e.stored_at >= since && e.expires_at > now)
            .map(|e| e.digest.clone())
    }

    pub fn insert(&self, key: impl Into<String>, digest: impl Into<String>, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            digest: digest.into(),
            stored_at: now,
            expires_at: now + ttl,
        };
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
