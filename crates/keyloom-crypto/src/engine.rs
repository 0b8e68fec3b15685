//! The engine capability trait and its default implementation.
//!
//! Callers (the session repository) talk to sessions and sender keys
//! exclusively through [`CryptoEngine`], with records as opaque bytes. Every
//! operation is value-in/value-out: the caller persists the returned record
//! only after the operation succeeds, so a failure never corrupts stored
//! state.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rand::rngs::OsRng;

use crate::creds::AccountCreds;
use crate::error::CryptoError;
use crate::keys::{KeyPair, PeerKeyBundle, SignedPreKeyRecord};
use crate::seal;
use crate::sender_key;
use crate::session::{self, EstablishKeys, MessageKind, SessionRecord};

/// An encrypted pairwise message with its wire kind.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    /// `pkmsg` for establishing messages, `msg` for normal traffic.
    pub kind: MessageKind,
    /// CBOR envelope: chain position, nonce, ciphertext, optional header.
    pub payload: Bytes,
}

/// Cryptographic capability provider for sessions and sender keys.
///
/// Session and sender-key records are opaque byte blobs owned by the caller;
/// implementations must treat them as immutable inputs and return the
/// successor record.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Generate a fresh X25519 key pair.
    fn generate_key_pair(&self) -> KeyPair;

    /// Sign `data` with the pair's derived signing key.
    fn sign(&self, pair: &KeyPair, data: &[u8]) -> Vec<u8>;

    /// Encrypt on an established session's send chain.
    async fn ratchet_encrypt(
        &self,
        session: &[u8],
        plaintext: &[u8],
    ) -> Result<(Bytes, SealedMessage), CryptoError>;

    /// Decrypt a pairwise message.
    ///
    /// With no stored session, the payload must be an establishing message
    /// and `establish` must carry the local handshake keys (including the
    /// consumed one-time pre-key when the header names one).
    async fn ratchet_decrypt(
        &self,
        session: Option<&[u8]>,
        payload: &[u8],
        establish: Option<EstablishKeys>,
    ) -> Result<(Bytes, Vec<u8>), CryptoError>;

    /// Peek the one-time pre-key id named by an establishing payload.
    fn establishing_pre_key_id(&self, payload: &[u8]) -> Result<Option<u32>, CryptoError>;

    /// Build a fresh outgoing session against a peer's published bundle.
    fn init_outgoing_session(
        &self,
        creds: &AccountCreds,
        bundle: &PeerKeyBundle,
    ) -> Result<Bytes, CryptoError>;

    /// Encrypt on our own sender-key chain for a group.
    async fn group_ratchet_encrypt(
        &self,
        record: &[u8],
        plaintext: &[u8],
    ) -> Result<(Bytes, Bytes), CryptoError>;

    /// Decrypt a group message on the sender's synchronized chain.
    async fn group_ratchet_decrypt(
        &self,
        record: &[u8],
        payload: &[u8],
    ) -> Result<(Bytes, Vec<u8>), CryptoError>;

    /// Snapshot a sender-key record (creating it when absent) into a
    /// distribution payload, returning `(record, payload)`.
    fn build_distribution_message(
        &self,
        record: Option<&[u8]>,
    ) -> Result<(Bytes, Bytes), CryptoError>;

    /// Build the sender's record from a received distribution payload.
    fn apply_distribution_message(&self, payload: &[u8]) -> Result<Bytes, CryptoError>;
}

/// Default engine over the crate's primitive stack, with OS randomness.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEngine;

impl DefaultEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CryptoEngine for DefaultEngine {
    fn generate_key_pair(&self) -> KeyPair {
        KeyPair::generate(&mut OsRng)
    }

    fn sign(&self, pair: &KeyPair, data: &[u8]) -> Vec<u8> {
        pair.sign(data)
    }

    async fn ratchet_encrypt(
        &self,
        session: &[u8],
        plaintext: &[u8],
    ) -> Result<(Bytes, SealedMessage), CryptoError> {
        let mut record: SessionRecord = seal::decode(session, "session")?;
        let (kind, payload) = session::encrypt(&mut record, plaintext, &mut OsRng)?;
        let record_bytes = seal::encode(&record, "session")?;
        Ok((Bytes::from(record_bytes), SealedMessage { kind, payload: Bytes::from(payload) }))
    }

    async fn ratchet_decrypt(
        &self,
        session: Option<&[u8]>,
        payload: &[u8],
        establish: Option<EstablishKeys>,
    ) -> Result<(Bytes, Vec<u8>), CryptoError> {
        let record = match session {
            Some(bytes) => Some(seal::decode::<SessionRecord>(bytes, "session")?),
            None => None,
        };
        let (record, plaintext) = session::decrypt(record, payload, establish.as_ref())?;
        Ok((Bytes::from(seal::encode(&record, "session")?), plaintext))
    }

    fn establishing_pre_key_id(&self, payload: &[u8]) -> Result<Option<u32>, CryptoError> {
        session::establishing_pre_key_id(payload)
    }

    fn init_outgoing_session(
        &self,
        creds: &AccountCreds,
        bundle: &PeerKeyBundle,
    ) -> Result<Bytes, CryptoError> {
        let ephemeral = KeyPair::generate(&mut OsRng);
        let record = session::initiate(creds, bundle, ephemeral)?;
        Ok(Bytes::from(seal::encode(&record, "session")?))
    }

    async fn group_ratchet_encrypt(
        &self,
        record: &[u8],
        plaintext: &[u8],
    ) -> Result<(Bytes, Bytes), CryptoError> {
        let (record, payload) = sender_key::encrypt(record, plaintext, &mut OsRng)?;
        Ok((Bytes::from(record), Bytes::from(payload)))
    }

    async fn group_ratchet_decrypt(
        &self,
        record: &[u8],
        payload: &[u8],
    ) -> Result<(Bytes, Vec<u8>), CryptoError> {
        let (record, plaintext) = sender_key::decrypt(record, payload)?;
        Ok((Bytes::from(record), plaintext))
    }

    fn build_distribution_message(
        &self,
        record: Option<&[u8]>,
    ) -> Result<(Bytes, Bytes), CryptoError> {
        let (record, payload) = sender_key::build_distribution(record, &mut OsRng)?;
        Ok((Bytes::from(record), Bytes::from(payload)))
    }

    fn apply_distribution_message(&self, payload: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::from(sender_key::apply_distribution(payload)?))
    }
}

/// Create the credentials for a fresh account/device.
///
/// Identity pair, signed pre-key id 1 with its signature, and a random
/// registration id; pre-key counters start at 1.
pub fn provision_creds(engine: &dyn CryptoEngine) -> AccountCreds {
    let identity = engine.generate_key_pair();
    let signed = engine.generate_key_pair();
    let signature = engine.sign(&identity, &signed.public());

    AccountCreds {
        identity,
        signed_pre_key: SignedPreKeyRecord { id: 1, pair: signed, signature },
        registration_id: OsRng.gen_range(1..=16383),
        next_pre_key_id: 1,
        first_unuploaded_pre_key_id: 1,
        advertised: false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn provisioned_creds_carry_a_valid_bundle() {
        let engine = DefaultEngine::new();
        let creds = provision_creds(&engine);

        assert!(creds.registration_id >= 1 && creds.registration_id <= 16383);
        assert_eq!(creds.signed_pre_key.id, 1);
        assert_eq!(creds.next_pre_key_id, 1);
        creds.bundle(None).verify().unwrap();
    }

    #[tokio::test]
    async fn engine_end_to_end_session() {
        let engine = DefaultEngine::new();
        let alice = provision_creds(&engine);
        let bob = provision_creds(&engine);

        let session = engine.init_outgoing_session(&alice, &bob.bundle(None)).unwrap();
        let (session, sealed) = engine.ratchet_encrypt(&session, b"hello").await.unwrap();
        assert_eq!(sealed.kind, MessageKind::Establishing);

        let keys = EstablishKeys {
            identity: bob.identity.clone(),
            signed_pre_key: bob.signed_pre_key.pair.clone(),
            one_time_pre_key: None,
        };
        let (bob_session, plaintext) =
            engine.ratchet_decrypt(None, &sealed.payload, Some(keys)).await.unwrap();
        assert_eq!(plaintext, b"hello");

        let (_, reply) = engine.ratchet_encrypt(&bob_session, b"hi back").await.unwrap();
        assert_eq!(reply.kind, MessageKind::Normal);
        let (_, plaintext) =
            engine.ratchet_decrypt(Some(&session), &reply.payload, None).await.unwrap();
        assert_eq!(plaintext, b"hi back");
    }

    #[tokio::test]
    async fn engine_end_to_end_group() {
        let engine = DefaultEngine::new();

        let (record, distribution) = engine.build_distribution_message(None).unwrap();
        let receiver = engine.apply_distribution_message(&distribution).unwrap();

        let (_, payload) = engine.group_ratchet_encrypt(&record, b"to the group").await.unwrap();
        let (_, plaintext) = engine.group_ratchet_decrypt(&receiver, &payload).await.unwrap();
        assert_eq!(plaintext, b"to the group");
    }

    #[test]
    fn corrupt_session_record_is_malformed() {
        let engine = DefaultEngine::new();
        let result = engine.establishing_pre_key_id(b"junk");
        assert!(matches!(result, Err(CryptoError::MalformedRecord { .. })));
    }
}
