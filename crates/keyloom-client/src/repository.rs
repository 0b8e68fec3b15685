//! The session repository: pairwise and group messaging over the
//! transactional store.
//!
//! Every operation that mutates durable state runs inside a coordinator
//! transaction scoped by the operation's address, so concurrent work on the
//! same peer or sender key serializes while unrelated addresses proceed in
//! parallel. Records are persisted only after the engine call succeeds; a
//! crypto failure leaves the stored record untouched.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keyloom_core::{KeyPatch, KeyType, ProtocolAddress, SenderKeyName, StoreError};
use keyloom_crypto::{
    AccountCreds, CryptoEngine, CryptoError, EstablishKeys, MessageKind, PeerKeyBundle,
    SealedMessage,
};
use keyloom_store::TransactionCoordinator;

use crate::codec;
use crate::error::RepositoryError;
use crate::session_cache::ShortLivedCache;

/// Shared, mutable account credentials.
pub type SharedCreds = Arc<Mutex<AccountCreds>>;

/// Session-record cache bounds.
const SESSION_CACHE_MAX: usize = 200;
const SESSION_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Sender-key-record cache bounds.
const SENDER_KEY_CACHE_MAX: usize = 100;
const SENDER_KEY_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Maps wire addresses to canonical identities.
///
/// Deployments with identity aliasing resolve aliases here so all state for
/// one peer lands under a single address. The default is a passthrough.
#[async_trait]
pub trait LidMapping: Send + Sync {
    /// Canonical address for `address`.
    async fn canonical(&self, address: &ProtocolAddress) -> ProtocolAddress;
}

/// Identity mapping: every address is already canonical.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughLidMapping;

#[async_trait]
impl LidMapping for PassthroughLidMapping {
    async fn canonical(&self, address: &ProtocolAddress) -> ProtocolAddress {
        address.clone()
    }
}

/// Result of a session probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// A session record exists for the peer.
    pub exists: bool,
    /// The record was served from the repository cache.
    pub cached: bool,
}

/// A group message plus the distribution message peers may need to follow
/// our sender-key chain.
#[derive(Debug, Clone)]
pub struct GroupEncrypted {
    /// The sealed group payload.
    pub ciphertext: Bytes,
    /// Snapshot of our sender-key chain, for members not yet synchronized.
    pub distribution_message: Bytes,
}

/// Pairwise and group session state over a [`TransactionCoordinator`].
pub struct SessionRepository {
    coordinator: Arc<TransactionCoordinator>,
    engine: Arc<dyn CryptoEngine>,
    creds: SharedCreds,
    lid: Arc<dyn LidMapping>,
    me: ProtocolAddress,
    sessions: ShortLivedCache,
    sender_keys: ShortLivedCache,
}

impl SessionRepository {
    /// Repository with the passthrough identity mapping.
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        engine: Arc<dyn CryptoEngine>,
        creds: SharedCreds,
        me: ProtocolAddress,
    ) -> Self {
        Self::with_lid_mapping(coordinator, engine, creds, me, Arc::new(PassthroughLidMapping))
    }

    /// Repository with an explicit identity mapping.
    pub fn with_lid_mapping(
        coordinator: Arc<TransactionCoordinator>,
        engine: Arc<dyn CryptoEngine>,
        creds: SharedCreds,
        me: ProtocolAddress,
        lid: Arc<dyn LidMapping>,
    ) -> Self {
        Self {
            coordinator,
            engine,
            creds,
            lid,
            me,
            sessions: ShortLivedCache::new(SESSION_CACHE_MAX, SESSION_CACHE_TTL),
            sender_keys: ShortLivedCache::new(SENDER_KEY_CACHE_MAX, SENDER_KEY_CACHE_TTL),
        }
    }

    /// Encrypt a 1:1 message on the peer's session.
    ///
    /// Fails [`RepositoryError::NoSession`] when no session exists; callers
    /// establish one first via [`inject_e2e_session`](Self::inject_e2e_session)
    /// or by decrypting the peer's establishing message.
    pub async fn encrypt_message(
        &self,
        peer: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<SealedMessage, RepositoryError> {
        let addr = self.lid.canonical(peer).await;
        let id = addr.to_string();

        self.coordinator
            .transaction(&id, || async {
                let session = self
                    .load_session(&id)
                    .await?
                    .ok_or_else(|| RepositoryError::NoSession(addr.clone()))?;
                let (record, sealed) = self.engine.ratchet_encrypt(&session, plaintext).await?;

                self.coordinator
                    .set(KeyPatch::insert_one(KeyType::Session, &id, record.clone()))
                    .await?;
                self.sessions.put(&id, record);
                Ok(sealed)
            })
            .await
    }

    /// Decrypt a 1:1 message of the given wire kind.
    ///
    /// Establishing messages (`pkmsg`) derive the session when none exists,
    /// consuming the one-time pre-key the header names; the deletion goes
    /// through the coordinator's validated path. Normal messages (`msg`)
    /// require a stored session.
    pub async fn decrypt_message(
        &self,
        peer: &ProtocolAddress,
        kind: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RepositoryError> {
        let kind = MessageKind::parse(kind)
            .ok_or_else(|| RepositoryError::UnknownMessageType { tag: kind.to_string() })?;
        let addr = self.lid.canonical(peer).await;
        let id = addr.to_string();

        self.coordinator
            .transaction(&id, || async {
                match kind {
                    MessageKind::Normal => self.decrypt_normal(&addr, &id, payload).await,
                    MessageKind::Establishing => self.decrypt_establishing(&id, payload).await,
                }
            })
            .await
    }

    /// Encrypt for a group on our own sender-key chain, creating the chain
    /// lazily. Returns the ciphertext together with the distribution message
    /// for members that have not synchronized our chain yet.
    ///
    /// The sending identity is the repository's own address, fixed at
    /// construction; a repository only ever writes its own chains.
    pub async fn encrypt_group_message(
        &self,
        group: &str,
        plaintext: &[u8],
    ) -> Result<GroupEncrypted, RepositoryError> {
        let name = SenderKeyName::new(group, self.me.clone());
        let id = name.to_string();

        self.coordinator
            .transaction(&id, || async {
                let existing = self.load_sender_key(&id).await?;
                let (record, distribution) =
                    self.engine.build_distribution_message(existing.as_deref())?;
                let (record, ciphertext) =
                    self.engine.group_ratchet_encrypt(&record, plaintext).await?;

                self.coordinator
                    .set(KeyPatch::insert_one(KeyType::SenderKey, &id, record.clone()))
                    .await?;
                self.sender_keys.put(&id, record);
                Ok(GroupEncrypted { ciphertext, distribution_message: distribution })
            })
            .await
    }

    /// Adopt a peer's sender-key chain from their distribution message.
    pub async fn process_sender_key_distribution_message(
        &self,
        group: Option<&str>,
        author: &ProtocolAddress,
        payload: &[u8],
    ) -> Result<(), RepositoryError> {
        let group = group.ok_or(RepositoryError::MissingGroupId)?;
        let author = self.lid.canonical(author).await;
        let name = SenderKeyName::new(group, author);
        let id = name.to_string();

        self.coordinator
            .transaction(&id, || async {
                let record = self.engine.apply_distribution_message(payload)?;
                self.coordinator
                    .set(KeyPatch::insert_one(KeyType::SenderKey, &id, record))
                    .await?;
                self.sender_keys.invalidate(&id);
                Ok(())
            })
            .await
    }

    /// Decrypt a group message on the author's synchronized chain.
    pub async fn decrypt_group_message(
        &self,
        group: &str,
        author: &ProtocolAddress,
        payload: &[u8],
    ) -> Result<Vec<u8>, RepositoryError> {
        let author = self.lid.canonical(author).await;
        let name = SenderKeyName::new(group, author);
        let id = name.to_string();

        self.coordinator
            .transaction(&id, || async {
                let record = self
                    .load_sender_key(&id)
                    .await?
                    .ok_or_else(|| RepositoryError::NoSenderKey(name.clone()))?;
                let (record, plaintext) =
                    self.engine.group_ratchet_decrypt(&record, payload).await?;

                self.coordinator
                    .set(KeyPatch::insert_one(KeyType::SenderKey, &id, record.clone()))
                    .await?;
                self.sender_keys.put(&id, record);
                Ok(plaintext)
            })
            .await
    }

    /// Establish an outgoing session from a peer's published key bundle.
    pub async fn inject_e2e_session(
        &self,
        peer: &ProtocolAddress,
        bundle: &PeerKeyBundle,
    ) -> Result<(), RepositoryError> {
        let addr = self.lid.canonical(peer).await;
        let id = addr.to_string();
        let creds = self.creds_snapshot();
        let record = self.engine.init_outgoing_session(&creds, bundle)?;

        self.coordinator
            .transaction(&id, || async {
                self.coordinator
                    .set(KeyPatch::insert_one(KeyType::Session, &id, record.clone()))
                    .await?;
                Ok::<_, RepositoryError>(())
            })
            .await?;
        self.sessions.invalidate(&id);
        Ok(())
    }

    /// Probe for a session without touching any record: repository cache
    /// first, then the store. A store hit lands in the repository cache so
    /// repeated probes stay local.
    pub async fn validate_session(
        &self,
        peer: &ProtocolAddress,
    ) -> Result<SessionStatus, RepositoryError> {
        let addr = self.lid.canonical(peer).await;
        let id = addr.to_string();

        if self.sessions.get(&id).is_some() {
            return Ok(SessionStatus { exists: true, cached: true });
        }
        let mut found = self.coordinator.get(KeyType::Session, &[id.clone()]).await?;
        match found.remove(&id) {
            Some(record) => {
                self.sessions.put(&id, record);
                Ok(SessionStatus { exists: true, cached: false })
            },
            None => Ok(SessionStatus { exists: false, cached: false }),
        }
    }

    /// Drop both repository caches. Stored records are untouched.
    pub fn clear_caches(&self) {
        self.sessions.clear();
        self.sender_keys.clear();
    }

    async fn decrypt_normal(
        &self,
        addr: &ProtocolAddress,
        id: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RepositoryError> {
        let session = self
            .load_session(id)
            .await?
            .ok_or_else(|| RepositoryError::NoSession(addr.clone()))?;
        let (record, plaintext) =
            self.engine.ratchet_decrypt(Some(&session), payload, None).await?;

        self.coordinator
            .set(KeyPatch::insert_one(KeyType::Session, id, record.clone()))
            .await?;
        self.sessions.put(id, record);
        Ok(plaintext)
    }

    async fn decrypt_establishing(
        &self,
        id: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RepositoryError> {
        let session = self.load_session(id).await?;
        let pre_key_id = self.engine.establishing_pre_key_id(payload)?;

        // A stored session wins over the header; handshake keys are only
        // assembled when the session must be derived.
        let establish = if session.is_some() {
            None
        } else {
            let creds = self.creds_snapshot();
            let one_time_pre_key = match pre_key_id {
                Some(pkid) => Some(self.load_pre_key(pkid).await?.ok_or(
                    RepositoryError::Crypto(CryptoError::MissingPreKey { id: pkid }),
                )?),
                None => None,
            };
            Some(EstablishKeys {
                identity: creds.identity.clone(),
                signed_pre_key: creds.signed_pre_key.pair.clone(),
                one_time_pre_key,
            })
        };

        let (record, plaintext) =
            self.engine.ratchet_decrypt(session.as_deref(), payload, establish).await?;

        let mut patch = KeyPatch::insert_one(KeyType::Session, id, record);
        if let Some(pkid) = pre_key_id {
            // Consumed one-time pre-key; the coordinator validates the
            // deletion and drops it if the key was never stored.
            patch.delete(KeyType::PreKey, pkid.to_string());
        }
        self.coordinator.set(patch).await?;
        self.sessions.invalidate(id);
        Ok(plaintext)
    }

    async fn load_session(&self, id: &str) -> Result<Option<Bytes>, StoreError> {
        if let Some(record) = self.sessions.get(id) {
            return Ok(Some(record));
        }
        let mut found = self.coordinator.get(KeyType::Session, &[id.to_string()]).await?;
        Ok(found.remove(id))
    }

    async fn load_sender_key(&self, id: &str) -> Result<Option<Bytes>, StoreError> {
        if let Some(record) = self.sender_keys.get(id) {
            return Ok(Some(record));
        }
        let mut found = self.coordinator.get(KeyType::SenderKey, &[id.to_string()]).await?;
        Ok(found.remove(id))
    }

    async fn load_pre_key(
        &self,
        id: u32,
    ) -> Result<Option<keyloom_crypto::KeyPair>, StoreError> {
        let key = id.to_string();
        let mut found = self.coordinator.get(KeyType::PreKey, &[key.clone()]).await?;
        match found.remove(&key) {
            Some(bytes) => Ok(Some(codec::decode_pre_key(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    #[allow(clippy::expect_used)]
    fn creds_snapshot(&self) -> AccountCreds {
        self.creds.lock().expect("credentials poisoned").clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keyloom_core::MemoryKeyStore;
    use keyloom_crypto::{DefaultEngine, provision_creds};
    use keyloom_store::TieredCache;

    use super::*;

    fn repository() -> SessionRepository {
        let engine = Arc::new(DefaultEngine::new());
        let creds = Arc::new(Mutex::new(provision_creds(engine.as_ref())));
        let cache = TieredCache::new(Arc::new(MemoryKeyStore::new()));
        let coordinator = Arc::new(TransactionCoordinator::new(cache));
        SessionRepository::new(coordinator, engine, creds, ProtocolAddress::new("me", 0))
    }

    #[tokio::test]
    async fn unknown_kind_tag_is_rejected() {
        let repo = repository();
        let result = repo
            .decrypt_message(&ProtocolAddress::new("alice", 0), "mystery", b"payload")
            .await;
        assert_eq!(
            result.err(),
            Some(RepositoryError::UnknownMessageType { tag: "mystery".to_string() })
        );
    }

    #[tokio::test]
    async fn distribution_without_group_is_rejected() {
        let repo = repository();
        let result = repo
            .process_sender_key_distribution_message(
                None,
                &ProtocolAddress::new("alice", 0),
                b"payload",
            )
            .await;
        assert_eq!(result.err(), Some(RepositoryError::MissingGroupId));
    }

    #[tokio::test]
    async fn normal_message_without_session_fails() {
        let repo = repository();
        let peer = ProtocolAddress::new("alice", 0);
        let result = repo.encrypt_message(&peer, b"hello").await;
        assert_eq!(result.err(), Some(RepositoryError::NoSession(peer)));
    }

    #[tokio::test]
    async fn group_message_without_sender_key_fails() {
        let repo = repository();
        let author = ProtocolAddress::new("alice", 0);
        let result = repo.decrypt_group_message("team", &author, b"payload").await;
        assert_eq!(
            result.err(),
            Some(RepositoryError::NoSenderKey(SenderKeyName::new("team", author)))
        );
    }
}
