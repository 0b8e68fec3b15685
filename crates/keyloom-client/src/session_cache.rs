//! Short-lived record caches owned by the repository.
//!
//! These sit above the store's tiered cache and hold decoded-record bytes
//! keyed by address, so back-to-back operations on the same peer or group
//! skip the store entirely. Small, TTL-bounded, and dropped wholesale by
//! `clear_caches`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

struct Entry {
    value: Bytes,
    inserted_at: Instant,
}

/// Bounded map with TTL expiry; overflow evicts the oldest quarter in bulk.
pub(crate) struct ShortLivedCache {
    max_entries: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ShortLivedCache {
    pub(crate) fn new(max_entries: usize, ttl: Duration) -> Self {
        Self { max_entries, ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Fetch a live entry; expired entries are dropped and count as misses.
    #[allow(clippy::expect_used)]
    pub(crate) fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some(entry) if Instant::now() - entry.inserted_at < self.ttl => {
                Some(entry.value.clone())
            },
            Some(_) => {
                entries.remove(key);
                None
            },
            None => None,
        }
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn put(&self, key: impl Into<String>, value: Bytes) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.insert(key.into(), Entry { value, inserted_at: Instant::now() });

        if entries.len() > self.max_entries {
            let mut by_age: Vec<(String, Instant)> =
                entries.iter().map(|(k, e)| (k.clone(), e.inserted_at)).collect();
            by_age.sort_by_key(|(_, inserted_at)| *inserted_at);

            let evict = entries.len() / 4;
            tracing::trace!(evict, "evicting oldest cached records");
            for (key, _) in by_age.into_iter().take(evict) {
                entries.remove(&key);
            }
        }
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn invalidate(&self, key: &str) {
        self.entries.lock().expect("cache poisoned").remove(key);
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn clear(&self) {
        self.entries.lock().expect("cache poisoned").clear();
    }

    #[cfg(test)]
    #[allow(clippy::expect_used)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_invalidate() {
        let cache = ShortLivedCache::new(8, Duration::from_secs(60));
        cache.put("alice.0", Bytes::from_static(b"record"));

        assert_eq!(cache.get("alice.0"), Some(Bytes::from_static(b"record")));
        cache.invalidate("alice.0");
        assert_eq!(cache.get("alice.0"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = ShortLivedCache::new(8, Duration::from_secs(300));
        cache.put("alice.0", Bytes::from_static(b"record"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.get("alice.0"), None);
        assert_eq!(cache.len(), 0, "expired entry is removed on access");
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_evicts_oldest_quarter() {
        let cache = ShortLivedCache::new(8, Duration::from_secs(300));
        for i in 0..9 {
            cache.put(format!("peer{i}.0"), Bytes::from_static(b"r"));
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(cache.len(), 7, "oldest quarter swept out");
        assert!(cache.get("peer0.0").is_none(), "oldest entry evicted");
        assert!(cache.get("peer8.0").is_some(), "newest entry kept");
    }
}
