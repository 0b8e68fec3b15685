//! Two-tier read cache in front of the persistent store.
//!
//! A small hot tier serves the ids that are accessed repeatedly (an entry is
//! promoted once its access count crosses a threshold); a larger general
//! tier absorbs everything else. Both tiers expire entries lazily by TTL and
//! shed load in bulk: once a tier runs a fixed slack past its capacity, the
//! oldest half is swept out in one pass so eviction cost stays bounded under
//! burst traffic.
//!
//! Writes go through: both tiers are updated, then the full patch is
//! forwarded to the store. The cache never retries store failures; retry
//! policy lives in the transaction coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use keyloom_core::{KeyPatch, KeyStore, KeyType, StoreError};
use tokio::time::Instant;

/// Tuning knobs for both cache tiers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries in the hot tier.
    pub hot_max: usize,
    /// Hot tier TTL.
    pub hot_ttl: Duration,
    /// Maximum entries in the general tier.
    pub general_max: usize,
    /// General tier TTL.
    pub general_ttl: Duration,
    /// Access count at which an id is promoted to the hot tier.
    pub hot_threshold: u32,
    /// Entries a tier may run past its max before the bulk sweep fires.
    pub overflow_slack: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_max: 500,
            hot_ttl: Duration::from_secs(30),
            general_max: 10_000,
            general_ttl: Duration::from_secs(10 * 60),
            hot_threshold: 3,
            overflow_slack: 50,
        }
    }
}

/// Bound on the access-count table before it is compacted.
const MAX_TRACKED_ACCESSES: usize = 1000;

type CacheKey = (KeyType, String);

#[derive(Clone)]
struct CacheEntry {
    value: Bytes,
    inserted_at: Instant,
}

#[derive(Default)]
struct CacheState {
    hot: HashMap<CacheKey, CacheEntry>,
    general: HashMap<CacheKey, CacheEntry>,
    access_counts: HashMap<CacheKey, u32>,
}

/// Two-tier, write-through cache over a [`KeyStore`].
///
/// Exposes the same `get`/`set`/`clear` contract as the store it wraps.
/// Store failures propagate unmodified.
pub struct TieredCache {
    store: Arc<dyn KeyStore>,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl TieredCache {
    /// Wrap a store with the default tier configuration.
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    /// Wrap a store with explicit tier configuration.
    pub fn with_config(store: Arc<dyn KeyStore>, config: CacheConfig) -> Self {
        Self { store, config, state: Mutex::new(CacheState::default()) }
    }

    /// Fetch a batch of ids, consulting the hot tier, then the general tier,
    /// then the store in a single batched call for the remainder.
    pub async fn get(
        &self,
        key_type: KeyType,
        ids: &[String],
    ) -> Result<HashMap<String, Bytes>, StoreError> {
        let (mut found, missing) = self.lookup_tiers(key_type, ids);

        if !missing.is_empty() {
            tracing::trace!(items = missing.len(), %key_type, "loading from store");
            let fetched = self.store.get(key_type, &missing).await?;
            self.populate(key_type, &fetched);
            found.extend(fetched);
        }

        Ok(found)
    }

    /// Write a patch through both tiers and forward it to the store.
    ///
    /// Deletions drop the id from both tiers; inserts land in the general
    /// tier and refresh the hot tier only when the id is already hot.
    #[allow(clippy::expect_used)]
    pub async fn set(&self, patch: &KeyPatch) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().expect("cache state poisoned");
            let now = Instant::now();
            let mut keys = 0usize;

            for key_type in patch.types() {
                let Some(entries) = patch.entries_for(key_type) else { continue };
                for (id, value) in entries {
                    let key = (key_type, id.clone());
                    match value {
                        Some(bytes) => {
                            let entry = CacheEntry { value: bytes.clone(), inserted_at: now };
                            if state.hot.contains_key(&key) {
                                state.hot.insert(key.clone(), entry.clone());
                            }
                            state.general.insert(key, entry);
                        },
                        None => {
                            state.hot.remove(&key);
                            state.general.remove(&key);
                            state.access_counts.remove(&key);
                        },
                    }
                    keys += 1;
                }
            }

            Self::evict_overflow(&mut state.general, self.general_bound());
            Self::evict_overflow(&mut state.hot, self.hot_bound());
            tracing::trace!(keys, "updated cache");
        }

        self.store.set(patch).await
    }

    /// Drop both tiers and clear the backing store.
    #[allow(clippy::expect_used)]
    pub async fn clear(&self) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().expect("cache state poisoned");
            state.hot.clear();
            state.general.clear();
            state.access_counts.clear();
        }
        self.store.clear().await
    }

    /// Current hot tier size. Test observability.
    #[allow(clippy::expect_used)]
    pub fn hot_len(&self) -> usize {
        self.state.lock().expect("cache state poisoned").hot.len()
    }

    /// Current general tier size. Test observability.
    #[allow(clippy::expect_used)]
    pub fn general_len(&self) -> usize {
        self.state.lock().expect("cache state poisoned").general.len()
    }

    /// True if the id currently sits in the hot tier. Test observability.
    #[allow(clippy::expect_used)]
    pub fn is_hot(&self, key_type: KeyType, id: &str) -> bool {
        self.state
            .lock()
            .expect("cache state poisoned")
            .hot
            .contains_key(&(key_type, id.to_string()))
    }

    /// Tier lookup for a batch of ids. Returns hits and the ids still
    /// needing a store fetch. Expired entries are removed and count as
    /// misses; general-tier hits past the access threshold are promoted.
    #[allow(clippy::expect_used)]
    fn lookup_tiers(
        &self,
        key_type: KeyType,
        ids: &[String],
    ) -> (HashMap<String, Bytes>, Vec<String>) {
        let mut state = self.state.lock().expect("cache state poisoned");
        let now = Instant::now();
        let mut found = HashMap::new();
        let mut missing = Vec::new();

        for id in ids {
            let key = (key_type, id.clone());
            Self::track_access(&mut state.access_counts, &key);

            if let Some(entry) = state.hot.get(&key) {
                if now - entry.inserted_at < self.config.hot_ttl {
                    found.insert(id.clone(), entry.value.clone());
                    continue;
                }
                state.hot.remove(&key);
            }

            if let Some(entry) = state.general.get(&key) {
                if now - entry.inserted_at < self.config.general_ttl {
                    let value = entry.value.clone();
                    if state.access_counts.get(&key).copied().unwrap_or(0)
                        >= self.config.hot_threshold
                    {
                        let promoted = CacheEntry { value: value.clone(), inserted_at: now };
                        state.hot.insert(key, promoted);
                        Self::evict_overflow(&mut state.hot, self.hot_bound());
                    }
                    found.insert(id.clone(), value);
                    continue;
                }
                state.general.remove(&key);
            }

            missing.push(id.clone());
        }

        (found, missing)
    }

    /// Insert freshly fetched values into the general tier (and the hot tier
    /// for ids that already crossed the promotion threshold).
    #[allow(clippy::expect_used)]
    fn populate(&self, key_type: KeyType, fetched: &HashMap<String, Bytes>) {
        let mut state = self.state.lock().expect("cache state poisoned");
        let now = Instant::now();

        for (id, value) in fetched {
            let key = (key_type, id.clone());
            let entry = CacheEntry { value: value.clone(), inserted_at: now };
            if state.access_counts.get(&key).copied().unwrap_or(0) >= self.config.hot_threshold {
                state.hot.insert(key.clone(), entry.clone());
            }
            state.general.insert(key, entry);
        }

        Self::evict_overflow(&mut state.general, self.general_bound());
        Self::evict_overflow(&mut state.hot, self.hot_bound());
    }

    fn hot_bound(&self) -> usize {
        self.config.hot_max + self.config.overflow_slack
    }

    fn general_bound(&self) -> usize {
        self.config.general_max + self.config.overflow_slack
    }

    /// Bulk sweep: past the bound (tier max plus slack), drop the oldest
    /// half by insertion time. One sort per overflow instead of per-insert
    /// bookkeeping.
    fn evict_overflow(tier: &mut HashMap<CacheKey, CacheEntry>, max: usize) {
        if tier.len() <= max {
            return;
        }
        let mut by_age: Vec<(CacheKey, Instant)> =
            tier.iter().map(|(k, e)| (k.clone(), e.inserted_at)).collect();
        by_age.sort_by_key(|(_, inserted_at)| *inserted_at);

        let evict = tier.len() / 2;
        tracing::trace!(evict, survivors = tier.len() - evict, "bulk cache eviction");
        for (key, _) in by_age.into_iter().take(evict) {
            tier.remove(&key);
        }
    }

    /// Bump the access count for one key; compact the table when it grows
    /// past its bound, keeping the most-accessed half at decayed counts.
    fn track_access(counts: &mut HashMap<CacheKey, u32>, key: &CacheKey) {
        *counts.entry(key.clone()).or_insert(0) += 1;

        if counts.len() > MAX_TRACKED_ACCESSES {
            let mut entries: Vec<(CacheKey, u32)> = counts.drain().collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            entries.truncate(MAX_TRACKED_ACCESSES / 2);
            counts.extend(entries.into_iter().map(|(k, count)| (k, count / 2)));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keyloom_core::MemoryKeyStore;
    use proptest::prelude::*;

    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            hot_max: 4,
            hot_ttl: Duration::from_secs(30),
            general_max: 8,
            general_ttl: Duration::from_secs(600),
            hot_threshold: 3,
            overflow_slack: 0,
        }
    }

    async fn seeded_cache(entries: &[(&str, &[u8])]) -> (TieredCache, MemoryKeyStore) {
        let store = MemoryKeyStore::new();
        let mut patch = KeyPatch::new();
        for (id, value) in entries {
            patch.insert(KeyType::Session, *id, Bytes::copy_from_slice(value));
        }
        if !patch.is_empty() {
            store.set(&patch).await.unwrap();
        }
        let cache = TieredCache::with_config(Arc::new(store.clone()), small_config());
        (cache, store)
    }

    #[tokio::test]
    async fn cached_ids_never_reach_the_store() {
        let (cache, store) = seeded_cache(&[("a.0", b"s1")]).await;

        let first = cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        assert_eq!(first["a.0"], Bytes::from_static(b"s1"));
        assert_eq!(store.fetch_count(), 1);

        for _ in 0..10 {
            let again = cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
            assert_eq!(again["a.0"], Bytes::from_static(b"s1"));
        }
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn absent_ids_are_omitted() {
        let (cache, _) = seeded_cache(&[("a.0", b"s1")]).await;
        let result = cache.get(KeyType::Session, &ids(&["a.0", "ghost.0"])).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(!result.contains_key("ghost.0"));
    }

    #[tokio::test]
    async fn hot_promotion_after_threshold() {
        let (cache, _) = seeded_cache(&[("a.0", b"s1")]).await;

        // Accesses 1 and 2: served from the general tier, not yet hot.
        cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        assert!(!cache.is_hot(KeyType::Session, "a.0"));

        // Access 3 crosses the threshold and promotes.
        cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        assert!(cache.is_hot(KeyType::Session, "a.0"));
    }

    #[tokio::test]
    async fn write_through_updates_store_and_tiers() {
        let (cache, store) = seeded_cache(&[]).await;

        cache
            .set(&KeyPatch::insert_one(KeyType::Session, "b.0", Bytes::from_static(b"fresh")))
            .await
            .unwrap();

        assert_eq!(store.peek(KeyType::Session, "b.0"), Some(Bytes::from_static(b"fresh")));
        // Served from cache without another store fetch.
        let fetches = store.fetch_count();
        let result = cache.get(KeyType::Session, &ids(&["b.0"])).await.unwrap();
        assert_eq!(result["b.0"], Bytes::from_static(b"fresh"));
        assert_eq!(store.fetch_count(), fetches);
    }

    #[tokio::test]
    async fn deletion_drops_both_tiers() {
        let (cache, store) = seeded_cache(&[("a.0", b"s1")]).await;

        // Promote to hot first.
        for _ in 0..3 {
            cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        }
        assert!(cache.is_hot(KeyType::Session, "a.0"));

        cache.set(&KeyPatch::delete_one(KeyType::Session, "a.0")).await.unwrap();
        assert!(!cache.is_hot(KeyType::Session, "a.0"));
        assert_eq!(store.peek(KeyType::Session, "a.0"), None);

        // Next get misses the tiers and reaches the store.
        let fetches = store.fetch_count();
        let result = cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(store.fetch_count(), fetches + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_treated_as_misses() {
        let (cache, store) = seeded_cache(&[("a.0", b"s1")]).await;

        cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        assert_eq!(store.fetch_count(), 1);

        tokio::time::advance(Duration::from_secs(601)).await;

        let result = cache.get(KeyType::Session, &ids(&["a.0"])).await.unwrap();
        assert_eq!(result["a.0"], Bytes::from_static(b"s1"));
        assert_eq!(store.fetch_count(), 2, "expired entry must be re-fetched");
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_evicts_oldest_half_in_bulk() {
        let (cache, _) = seeded_cache(&[]).await;

        // general_max is 8; insert 9 entries with strictly increasing ages.
        for i in 0..9 {
            cache
                .set(&KeyPatch::insert_one(
                    KeyType::Session,
                    format!("peer{i}.0"),
                    Bytes::from_static(b"s"),
                ))
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert!(cache.general_len() <= 8, "tier must come back under capacity");
        // The newest entries survive the sweep.
        let state = cache.get(KeyType::Session, &ids(&["peer8.0"])).await.unwrap();
        assert_eq!(state.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_waits_for_the_overflow_slack() {
        let store = MemoryKeyStore::new();
        let config = CacheConfig { general_max: 4, overflow_slack: 2, ..small_config() };
        let cache = TieredCache::with_config(Arc::new(store), config);

        for i in 0..6 {
            cache
                .set(&KeyPatch::insert_one(
                    KeyType::Session,
                    format!("peer{i}.0"),
                    Bytes::from_static(b"s"),
                ))
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.general_len(), 6, "within slack, nothing is swept");

        cache
            .set(&KeyPatch::insert_one(KeyType::Session, "peer6.0", Bytes::from_static(b"s")))
            .await
            .unwrap();
        assert_eq!(cache.general_len(), 4, "crossing the slack sweeps the oldest half");
    }

    proptest! {
        #[test]
        fn eviction_keeps_tier_at_or_under_capacity(entries in 0usize..64, max in 1usize..32) {
            let now = Instant::now();
            let mut tier: HashMap<CacheKey, CacheEntry> = (0..entries)
                .map(|i| {
                    let key = (KeyType::Session, format!("peer{i}.0"));
                    let entry = CacheEntry {
                        value: Bytes::from_static(b"s"),
                        inserted_at: now + Duration::from_millis(i as u64),
                    };
                    (key, entry)
                })
                .collect();

            TieredCache::evict_overflow(&mut tier, max);
            prop_assert!(tier.len() <= max.max(entries.saturating_sub(entries / 2)));
            if entries > max {
                // The newest entry always survives a sweep.
                let newest = (KeyType::Session, format!("peer{}.0", entries - 1));
                prop_assert!(tier.contains_key(&newest));
            }
        }
    }

    #[tokio::test]
    async fn store_failures_propagate_without_retry() {
        let (cache, store) = seeded_cache(&[]).await;
        store.fail_next_sets(1);

        let patch = KeyPatch::insert_one(KeyType::PreKey, "1", Bytes::new());
        let err = cache.set(&patch).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.set_count(), 0, "cache must not retry on its own");
    }
}
