//! Scoped transactions over the cached store.
//!
//! A transaction batches every write issued during its body into a single
//! [`KeyPatch`] and commits it once, with bounded retries, when the outermost
//! body finishes successfully. Reads inside a transaction are served from a
//! transaction-local cache so an id is fetched from the store at most once
//! per transaction.
//!
//! Openness is global: while any transaction is open, all reads and writes
//! on the coordinator join it, whichever call path they arrive on. Scope
//! tokens serialize transactions against each other; a transaction opened
//! with a token already open in the current task joins the outer one instead
//! of deadlocking on its own scope lock.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::mem;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use keyloom_core::{KeyPatch, KeyType, StoreError};

use crate::lock_registry::{LockKey, LockRegistry};
use crate::tiered_cache::TieredCache;

tokio::task_local! {
    /// Scope tokens whose transactions are open in the current task, for
    /// re-entrancy detection.
    static OPEN_SCOPES: RefCell<HashSet<String>>;
}

/// Commit retry policy.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Total commit attempts before giving up.
    pub max_commit_retries: u32,
    /// Fixed delay between commit attempts.
    pub retry_delay: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { max_commit_retries: 10, retry_delay: Duration::from_secs(3) }
    }
}

#[derive(Default)]
struct TxState {
    /// Number of transaction bodies currently open, across all scopes.
    open: u32,
    /// Values read (or written) during the open transactions. Inner `None`
    /// marks a pending deletion.
    read_cache: HashMap<KeyType, HashMap<String, Option<Bytes>>>,
    /// Writes accumulated for the commit.
    mutations: KeyPatch,
}

/// Transactional front of the key store.
///
/// Wraps a [`TieredCache`] and adds scoped mutual exclusion, write batching
/// and commit retry. All store traffic of a session should flow through one
/// coordinator instance.
pub struct TransactionCoordinator {
    cache: TieredCache,
    locks: LockRegistry,
    config: TransactionConfig,
    tx: Mutex<TxState>,
}

impl TransactionCoordinator {
    /// Coordinator with the default retry policy.
    pub fn new(cache: TieredCache) -> Self {
        Self::with_config(cache, TransactionConfig::default())
    }

    /// Coordinator with an explicit retry policy.
    pub fn with_config(cache: TieredCache, config: TransactionConfig) -> Self {
        Self { cache, locks: LockRegistry::new(), config, tx: Mutex::new(TxState::default()) }
    }

    /// True while any transaction body is open.
    #[allow(clippy::expect_used)]
    pub fn in_transaction(&self) -> bool {
        self.tx.lock().expect("transaction state poisoned").open > 0
    }

    /// Run `work` inside a transaction identified by `scope`.
    ///
    /// Transactions with the same scope token are serialized in arrival
    /// order; a same-token transaction opened inside an open body of the
    /// current task joins it instead of waiting on itself. The scope lock is
    /// held until the commit has been applied (or abandoned), so a later
    /// same-token transaction always observes the committed state.
    pub async fn transaction<T, E, F, Fut>(&self, scope: &str, work: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let reentrant = OPEN_SCOPES
            .try_with(|scopes| scopes.borrow().contains(scope))
            .unwrap_or(false);
        if reentrant {
            tracing::trace!(scope, "joining open transaction");
            return self.execute(work).await;
        }

        let lock = self.locks.handle(&LockKey::Scope(scope.to_string()));
        let _guard = lock.lock_owned().await;

        // Track the token for the duration of the body. The task-local set
        // only exists once some transaction established it on this task.
        let joined_existing = OPEN_SCOPES
            .try_with(|scopes| {
                scopes.borrow_mut().insert(scope.to_string());
            })
            .is_ok();

        if joined_existing {
            let result = self.execute(work).await;
            let _ = OPEN_SCOPES.try_with(|scopes| {
                scopes.borrow_mut().remove(scope);
            });
            result
        } else {
            let mut seeded = HashSet::new();
            seeded.insert(scope.to_string());
            OPEN_SCOPES.scope(RefCell::new(seeded), self.execute(work)).await
        }
    }

    /// Read a batch of ids, joining an open transaction if one exists.
    pub async fn get(
        &self,
        key_type: KeyType,
        ids: &[String],
    ) -> Result<HashMap<String, Bytes>, StoreError> {
        if self.in_transaction() {
            self.transactional_get(key_type, ids).await
        } else {
            self.direct_get(key_type, ids).await
        }
    }

    /// Apply a patch, joining an open transaction if one exists.
    ///
    /// Inside a transaction the patch only lands in the mutation batch;
    /// outside, it is applied to the cache and store immediately under the
    /// relevant namespace locks.
    pub async fn set(&self, patch: KeyPatch) -> Result<(), StoreError> {
        if self.in_transaction() {
            self.transactional_set(patch).await
        } else {
            self.direct_set(patch).await
        }
    }

    /// Drop all cached and stored entries. Must not be called with a
    /// transaction open.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.cache.clear().await
    }

    /// Open one transaction body, run it, commit if outermost.
    #[allow(clippy::expect_used)]
    async fn execute<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let depth = {
            let mut tx = self.tx.lock().expect("transaction state poisoned");
            tx.open += 1;
            tx.open
        };
        tracing::trace!(depth, "transaction body opened");

        let outcome = match work().await {
            Ok(value) => {
                let pending = {
                    let mut tx = self.tx.lock().expect("transaction state poisoned");
                    if tx.open == 1 { mem::take(&mut tx.mutations) } else { KeyPatch::new() }
                };
                if pending.is_empty() {
                    Ok(value)
                } else {
                    tracing::trace!(entries = pending.len(), "committing transaction");
                    match self.commit_with_retries(&pending).await {
                        Ok(()) => Ok(value),
                        Err(err) => Err(E::from(err)),
                    }
                }
            },
            Err(err) => {
                tracing::trace!("transaction body failed, discarding mutations");
                Err(err)
            },
        };

        let mut tx = self.tx.lock().expect("transaction state poisoned");
        tx.open -= 1;
        if tx.open == 0 {
            tx.read_cache.clear();
            tx.mutations = KeyPatch::new();
        }
        outcome
    }

    /// Write the batch through the cache, retrying transient failures with a
    /// fixed delay. Exhaustion surfaces as [`StoreError::CommitFailed`].
    async fn commit_with_retries(&self, patch: &KeyPatch) -> Result<(), StoreError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.cache.set(patch).await {
                Ok(()) => {
                    tracing::trace!(entries = patch.len(), attempts, "committed mutations");
                    return Ok(());
                },
                Err(err) if err.is_transient() && attempts < self.config.max_commit_retries => {
                    tracing::warn!(
                        error = %err,
                        attempts,
                        remaining = self.config.max_commit_retries - attempts,
                        "commit failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                },
                Err(err) => {
                    return Err(StoreError::CommitFailed {
                        attempts,
                        last_error: err.to_string(),
                    });
                },
            }
        }
    }

    /// Transaction-scoped read: serve from the transaction cache, fetching
    /// ids it has not seen under the namespace lock (per-identity locks for
    /// sender keys, so unrelated groups stay parallel).
    async fn transactional_get(
        &self,
        key_type: KeyType,
        ids: &[String],
    ) -> Result<HashMap<String, Bytes>, StoreError> {
        let missing = self.uncached_ids(key_type, ids);
        if !missing.is_empty() {
            tracing::trace!(items = missing.len(), %key_type, "loading into transaction cache");
            if key_type == KeyType::SenderKey {
                for id in &missing {
                    let lock = self.locks.handle(&LockKey::SenderKey(id.clone()));
                    let _guard = lock.lock().await;
                    let still = self.uncached_ids(key_type, std::slice::from_ref(id));
                    if !still.is_empty() {
                        let fetched = self.cache.get(key_type, &still).await?;
                        self.absorb(key_type, fetched);
                    }
                }
            } else {
                let lock = self.locks.handle(&LockKey::KeyType(key_type));
                let _guard = lock.lock().await;
                let still = self.uncached_ids(key_type, &missing);
                if !still.is_empty() {
                    let fetched = self.cache.get(key_type, &still).await?;
                    self.absorb(key_type, fetched);
                }
            }
        }
        Ok(self.cached_values(key_type, ids))
    }

    /// Read outside any transaction, under the namespace lock. Sender keys
    /// travel one identity at a time under their own locks, so slow reads
    /// for one group never block another.
    async fn direct_get(
        &self,
        key_type: KeyType,
        ids: &[String],
    ) -> Result<HashMap<String, Bytes>, StoreError> {
        if key_type == KeyType::SenderKey {
            let mut found = HashMap::new();
            for id in ids {
                let lock = self.locks.handle(&LockKey::SenderKey(id.clone()));
                let _guard = lock.lock().await;
                found.extend(self.cache.get(key_type, std::slice::from_ref(id)).await?);
            }
            return Ok(found);
        }

        let lock = self.locks.handle(&LockKey::KeyType(key_type));
        let _guard = lock.lock().await;
        self.cache.get(key_type, ids).await
    }

    /// Queue a patch into the open transaction.
    ///
    /// Pre-key deletions are validated first: ids the transaction already
    /// observed pass directly, ids it has not are probed through the
    /// transaction read path and thus the store. A deletion of an id that
    /// exists nowhere is dropped with a warning rather than risking a blind
    /// delete at commit.
    #[allow(clippy::expect_used)]
    async fn transactional_set(&self, mut patch: KeyPatch) -> Result<(), StoreError> {
        if let Some(entries) = patch.entries_for(KeyType::PreKey) {
            let suspect: Vec<String> = entries
                .iter()
                .filter(|(_, value)| value.is_none())
                .map(|(id, _)| id.clone())
                .collect();
            if !suspect.is_empty() {
                let known = self.transactional_get(KeyType::PreKey, &suspect).await?;
                for id in suspect {
                    if !known.contains_key(&id) {
                        tracing::warn!(id, "dropping deletion of unknown pre-key");
                        patch.remove(KeyType::PreKey, &id);
                    }
                }
            }
        }

        let mut tx = self.tx.lock().expect("transaction state poisoned");
        for key_type in patch.types().collect::<Vec<_>>() {
            let Some(entries) = patch.entries_for(key_type) else { continue };
            let table = tx.read_cache.entry(key_type).or_default();
            for (id, value) in entries {
                table.insert(id.clone(), value.clone());
            }
        }
        tx.mutations.merge(patch);
        Ok(())
    }

    /// Immediate write outside any transaction, under namespace locks.
    async fn direct_set(&self, mut patch: KeyPatch) -> Result<(), StoreError> {
        // Sender keys are written one identity at a time under their own
        // locks, so a slow write for one group never blocks another.
        if let Some(sender_keys) = patch.take_type(KeyType::SenderKey) {
            for (id, value) in sender_keys {
                let lock = self.locks.handle(&LockKey::SenderKey(id.clone()));
                let _guard = lock.lock().await;
                let single = match value {
                    Some(bytes) => KeyPatch::insert_one(KeyType::SenderKey, id, bytes),
                    None => KeyPatch::delete_one(KeyType::SenderKey, id),
                };
                self.cache.set(&single).await?;
            }
        }
        if patch.is_empty() {
            return Ok(());
        }

        // Remaining namespaces locked in canonical name order so concurrent
        // multi-type writes cannot deadlock.
        let mut types: Vec<KeyType> = patch.types().collect();
        types.sort_by_key(|key_type| key_type.as_str());
        let mut guards = Vec::with_capacity(types.len());
        for key_type in &types {
            let lock = self.locks.handle(&LockKey::KeyType(*key_type));
            guards.push(lock.lock_owned().await);
        }

        self.validate_direct_pre_key_deletions(&mut patch).await?;
        if patch.is_empty() {
            return Ok(());
        }
        self.cache.set(&patch).await
    }

    /// Drop pre-key deletions whose id is not present in the cached store.
    async fn validate_direct_pre_key_deletions(
        &self,
        patch: &mut KeyPatch,
    ) -> Result<(), StoreError> {
        let Some(entries) = patch.entries_for(KeyType::PreKey) else {
            return Ok(());
        };
        let deletions: Vec<String> = entries
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if deletions.is_empty() {
            return Ok(());
        }

        let existing = self.cache.get(KeyType::PreKey, &deletions).await?;
        for id in deletions {
            if !existing.contains_key(&id) {
                tracing::warn!(id, "dropping deletion of unknown pre-key");
                patch.remove(KeyType::PreKey, &id);
            }
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn uncached_ids(&self, key_type: KeyType, ids: &[String]) -> Vec<String> {
        let tx = self.tx.lock().expect("transaction state poisoned");
        let Some(table) = tx.read_cache.get(&key_type) else {
            return ids.to_vec();
        };
        ids.iter().filter(|id| !table.contains_key(*id)).cloned().collect()
    }

    #[allow(clippy::expect_used)]
    fn absorb(&self, key_type: KeyType, fetched: HashMap<String, Bytes>) {
        let mut tx = self.tx.lock().expect("transaction state poisoned");
        let table = tx.read_cache.entry(key_type).or_default();
        for (id, value) in fetched {
            table.insert(id, Some(value));
        }
    }

    #[allow(clippy::expect_used)]
    fn cached_values(&self, key_type: KeyType, ids: &[String]) -> HashMap<String, Bytes> {
        let tx = self.tx.lock().expect("transaction state poisoned");
        let Some(table) = tx.read_cache.get(&key_type) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| {
                table.get(id).and_then(Clone::clone).map(|value| (id.clone(), value))
            })
            .collect()
    }
}
