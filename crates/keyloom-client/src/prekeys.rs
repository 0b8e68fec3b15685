//! One-time pre-key allocation.
//!
//! Ids are handed out deterministically from the credentials'
//! `next_pre_key_id` counter; generated pairs are persisted as `pre-key`
//! entries through the coordinator. Generation is paced in small batches so
//! a large allocation never starves the executor, and a pre-generation
//! buffer absorbs bursts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keyloom_core::{KeyPatch, KeyType, StoreError};
use keyloom_crypto::{CredsUpdate, CryptoEngine, KeyPair};
use keyloom_store::TransactionCoordinator;
use tokio::time::Instant;

use crate::codec;
use crate::error::RepositoryError;
use crate::repository::SharedCreds;

/// Keys generated per batch before yielding.
const GENERATION_BATCH: usize = 10;

/// Pause between buffered generation batches.
const GENERATION_COOLDOWN: Duration = Duration::from_millis(100);

/// How long a pre-generated buffer stays usable.
const BUFFER_WINDOW: Duration = Duration::from_secs(5);

/// Ids fetched per store call when re-reading a persisted range.
const FETCH_BATCH: usize = 50;

/// A batch of pre-keys ready for upload.
#[derive(Debug)]
pub struct PreKeyBatch {
    /// Counter advance to persist alongside the upload.
    pub update: CredsUpdate,
    /// The pre-keys, ordered by id.
    pub pre_keys: BTreeMap<u32, KeyPair>,
}

struct Buffer {
    keys: Vec<KeyPair>,
    filled_at: Option<Instant>,
}

/// Generates, persists and re-reads one-time pre-keys.
pub struct PreKeyAllocator {
    coordinator: Arc<TransactionCoordinator>,
    engine: Arc<dyn CryptoEngine>,
    creds: SharedCreds,
    buffer: tokio::sync::Mutex<Buffer>,
}

impl PreKeyAllocator {
    /// Allocator over the given coordinator, engine and credentials.
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        engine: Arc<dyn CryptoEngine>,
        creds: SharedCreds,
    ) -> Self {
        Self {
            coordinator,
            engine,
            creds,
            buffer: tokio::sync::Mutex::new(Buffer { keys: Vec::new(), filled_at: None }),
        }
    }

    /// Fill the buffer ahead of an expected burst.
    ///
    /// Generation runs in batches with a cooldown between them. Buffered
    /// keys are consumed by [`allocate`](Self::allocate) within the reuse
    /// window; afterwards they are discarded.
    pub async fn pre_generate(&self, count: usize) {
        let mut buffer = self.buffer.lock().await;
        let missing = count.saturating_sub(buffer.keys.len());
        if missing > 0 {
            let fresh = self.generate_batched(missing, Some(GENERATION_COOLDOWN)).await;
            buffer.keys.extend(fresh);
        }
        buffer.filled_at = Some(Instant::now());
        tracing::trace!(buffered = buffer.keys.len(), "pre-generated pre-key buffer");
    }

    /// Generate `count` pre-keys with deterministic ids, persist them, and
    /// advance the credentials counters.
    ///
    /// The returned [`CredsUpdate`] has already been applied to the shared
    /// credentials; callers persist it upstream.
    pub async fn allocate(
        &self,
        count: u32,
    ) -> Result<(CredsUpdate, BTreeMap<u32, KeyPair>), RepositoryError> {
        let mut keys = self.drain_buffer(count as usize).await;
        let missing = (count as usize).saturating_sub(keys.len());
        if missing > 0 {
            keys.extend(self.generate_batched(missing, None).await);
        }

        let (start, update) = self.advance_counters(count);
        let mut patch = KeyPatch::new();
        let mut out = BTreeMap::new();
        for (offset, pair) in keys.into_iter().enumerate() {
            let id = start + offset as u32;
            patch.insert(KeyType::PreKey, id.to_string(), codec::encode_pre_key(&pair)?);
            out.insert(id, pair);
        }

        tracing::trace!(count, start, "allocated pre-keys");
        self.coordinator.set(patch).await?;
        Ok((update, out))
    }

    /// Produce the next `count` pre-keys for bundle publication.
    ///
    /// Generates only what the unuploaded range is short of, then re-reads
    /// the whole range from the store in fetch batches. Marks the range as
    /// uploaded in the returned update.
    pub async fn get_next_pre_keys(&self, count: u32) -> Result<PreKeyBatch, RepositoryError> {
        self.coordinator
            .transaction("pre-keys", || async {
                let (first, next) = {
                    let creds = self.lock_creds();
                    (creds.first_unuploaded_pre_key_id, creds.next_pre_key_id)
                };
                let available = next.saturating_sub(first);
                if available < count {
                    self.allocate(count - available).await?;
                }

                let ids: Vec<String> = (first..first + count).map(|id| id.to_string()).collect();
                let mut pre_keys = BTreeMap::new();
                for chunk in ids.chunks(FETCH_BATCH) {
                    let found = self.coordinator.get(KeyType::PreKey, chunk).await?;
                    for (id, bytes) in found {
                        let pair = codec::decode_pre_key(&id, &bytes)?;
                        let numeric = id.parse::<u32>().map_err(|_| StoreError::Decode {
                            key_type: "pre-key",
                            id: id.clone(),
                        })?;
                        pre_keys.insert(numeric, pair);
                    }
                }

                let update = {
                    let mut creds = self.lock_creds();
                    creds.first_unuploaded_pre_key_id = first + count;
                    CredsUpdate {
                        next_pre_key_id: creds.next_pre_key_id,
                        first_unuploaded_pre_key_id: creds.first_unuploaded_pre_key_id,
                    }
                };
                Ok(PreKeyBatch { update, pre_keys })
            })
            .await
    }

    /// Take up to `want` keys from a still-fresh buffer; a stale buffer is
    /// discarded.
    async fn drain_buffer(&self, want: usize) -> Vec<KeyPair> {
        let mut buffer = self.buffer.lock().await;
        match buffer.filled_at {
            Some(at) if Instant::now() - at < BUFFER_WINDOW => {
                let take = buffer.keys.len().min(want);
                buffer.keys.drain(..take).collect()
            },
            Some(_) => {
                tracing::trace!(discarded = buffer.keys.len(), "pre-key buffer expired");
                buffer.keys.clear();
                buffer.filled_at = None;
                Vec::new()
            },
            None => Vec::new(),
        }
    }

    async fn generate_batched(&self, count: usize, cooldown: Option<Duration>) -> Vec<KeyPair> {
        let mut keys = Vec::with_capacity(count);
        while keys.len() < count {
            let batch = (count - keys.len()).min(GENERATION_BATCH);
            for _ in 0..batch {
                keys.push(self.engine.generate_key_pair());
            }
            if keys.len() < count {
                match cooldown {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => tokio::task::yield_now().await,
                }
            }
        }
        keys
    }

    fn advance_counters(&self, count: u32) -> (u32, CredsUpdate) {
        let mut creds = self.lock_creds();
        let start = creds.next_pre_key_id;
        let update = CredsUpdate {
            next_pre_key_id: start + count,
            first_unuploaded_pre_key_id: creds.first_unuploaded_pre_key_id,
        };
        update.apply(&mut creds);
        (start, update)
    }

    #[allow(clippy::expect_used)]
    fn lock_creds(&self) -> std::sync::MutexGuard<'_, keyloom_crypto::AccountCreds> {
        self.creds.lock().expect("credentials poisoned")
    }
}
