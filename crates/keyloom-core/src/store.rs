//! Persistent store contract and in-memory implementation.
//!
//! The trait is asynchronous: real backends live behind file or database
//! I/O, and every call is a suspension point. [`MemoryKeyStore`] backs tests
//! and simulation, with operation counters and a fault-injection hook for
//! exercising commit-retry paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{KeyPatch, KeyType, StoreError};

/// Durable key-value storage, partitioned by [`KeyType`].
///
/// Implementations must apply a whole [`KeyPatch`] atomically: a `set` either
/// persists every entry or none. Failures propagate to the caller; retry
/// policy belongs to the transaction layer, never the store.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch a batch of ids within one key type.
    ///
    /// Absent ids are omitted from the returned map, not mapped to an error.
    async fn get(
        &self,
        key_type: KeyType,
        ids: &[String],
    ) -> Result<HashMap<String, Bytes>, StoreError>;

    /// Apply a patch of writes and deletions atomically.
    async fn set(&self, patch: &KeyPatch) -> Result<(), StoreError>;

    /// Drop all stored entries.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory [`KeyStore`] for testing and simulation.
///
/// Tracks fetch and write counts so tests can assert cache-hit invariants,
/// and can be told to fail the next N `set` calls to exercise commit retry.
/// All state sits behind `Arc<Mutex<_>>`, so clones share one store.
///
/// # Panics
///
/// Methods panic if the internal mutex is poisoned (a thread panicked while
/// holding the lock). Acceptable for test/simulation code.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    inner: Arc<Mutex<MemoryKeyStoreInner>>,
}

#[derive(Default)]
struct MemoryKeyStoreInner {
    tables: HashMap<KeyType, HashMap<String, Bytes>>,
    fetch_count: u64,
    set_count: u64,
    failing_sets: u32,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls that reached this store.
    #[allow(clippy::expect_used)]
    pub fn fetch_count(&self) -> u64 {
        self.inner.lock().expect("mutex poisoned").fetch_count
    }

    /// Number of successful `set` calls applied to this store.
    #[allow(clippy::expect_used)]
    pub fn set_count(&self) -> u64 {
        self.inner.lock().expect("mutex poisoned").set_count
    }

    /// Make the next `n` calls to `set` fail with a backend error.
    #[allow(clippy::expect_used)]
    pub fn fail_next_sets(&self, n: u32) {
        self.inner.lock().expect("mutex poisoned").failing_sets = n;
    }

    /// Number of entries stored under one key type.
    #[allow(clippy::expect_used)]
    pub fn len_of(&self, key_type: KeyType) -> usize {
        self.inner
            .lock()
            .expect("mutex poisoned")
            .tables
            .get(&key_type)
            .map_or(0, HashMap::len)
    }

    /// Read one entry directly, bypassing counters. Test convenience.
    #[allow(clippy::expect_used)]
    pub fn peek(&self, key_type: KeyType, id: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .expect("mutex poisoned")
            .tables
            .get(&key_type)
            .and_then(|table| table.get(id).cloned())
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    #[allow(clippy::expect_used)]
    async fn get(
        &self,
        key_type: KeyType,
        ids: &[String],
    ) -> Result<HashMap<String, Bytes>, StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.fetch_count += 1;

        let Some(table) = inner.tables.get(&key_type) else {
            return Ok(HashMap::new());
        };

        Ok(ids
            .iter()
            .filter_map(|id| table.get(id).map(|value| (id.clone(), value.clone())))
            .collect())
    }

    #[allow(clippy::expect_used)]
    async fn set(&self, patch: &KeyPatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");

        if inner.failing_sets > 0 {
            inner.failing_sets -= 1;
            return Err(StoreError::Backend("injected set failure".to_string()));
        }

        for key_type in patch.types() {
            let Some(entries) = patch.entries_for(key_type) else { continue };
            let table = inner.tables.entry(key_type).or_default();
            for (id, value) in entries {
                match value {
                    Some(bytes) => {
                        table.insert(id.clone(), bytes.clone());
                    },
                    None => {
                        table.remove(id);
                    },
                }
            }
        }

        inner.set_count += 1;
        Ok(())
    }

    #[allow(clippy::expect_used)]
    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.lock().expect("mutex poisoned").tables.clear();
        Ok(())
    }
}
