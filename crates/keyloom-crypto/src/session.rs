//! Pairwise sessions: X3DH-style establishment and per-message chains.
//!
//! A session holds two forward-secure chains, one per direction. The
//! initiator derives both from a triple (or quadruple, with a one-time
//! pre-key) Diffie-Hellman handshake against the peer's published bundle;
//! the first outgoing message carries an establishing header with the
//! handshake publics so the responder can derive the mirror-image session
//! without any prior state.

use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::chain::ChainState;
use crate::creds::AccountCreds;
use crate::error::CryptoError;
use crate::keys::{KeyPair, PeerKeyBundle};
use crate::seal;

/// HKDF info label for chain seed derivation.
const SESSION_LABEL: &[u8] = b"keyloomSessionV1";

/// Nonce context for pairwise messages.
const SESSION_CONTEXT: [u8; 8] = *b"kl-sess1";

/// Tags distinguishing establishing messages from normal traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// First message(s) of a session, carrying the handshake header.
    Establishing,
    /// Message on an already-established session.
    Normal,
}

impl MessageKind {
    /// Canonical wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Establishing => "pkmsg",
            Self::Normal => "msg",
        }
    }

    /// Parse a wire tag; `None` for unknown tags.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "pkmsg" => Some(Self::Establishing),
            "msg" => Some(Self::Normal),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The local private keys a responder needs to process an establishing
/// message.
#[derive(Debug, Clone)]
pub struct EstablishKeys {
    /// Local identity pair.
    pub identity: KeyPair,
    /// The signed pre-key the initiator encrypted against.
    pub signed_pre_key: KeyPair,
    /// The consumed one-time pre-key, when the header names one.
    pub one_time_pre_key: Option<KeyPair>,
}

/// Handshake publics carried by establishing messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EstablishHeader {
    pub identity: [u8; 32],
    pub ephemeral: [u8; 32],
    pub signed_pre_key_id: u32,
    pub pre_key_id: Option<u32>,
}

/// Persisted pairwise session state.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SessionRecord {
    send: ChainState,
    recv: ChainState,
    /// Header still to be delivered; attached to the next outgoing message.
    pending: Option<EstablishHeader>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    generation: u32,
    nonce: [u8; 24],
    ciphertext: Vec<u8>,
    header: Option<EstablishHeader>,
}

/// Initiator half of the handshake: derive a session against a peer bundle.
///
/// Verifies the bundle's signed pre-key signature first. The returned record
/// has the establishing header pending for the next encrypt.
pub(crate) fn initiate(
    creds: &AccountCreds,
    bundle: &PeerKeyBundle,
    ephemeral: KeyPair,
) -> Result<SessionRecord, CryptoError> {
    bundle.verify()?;

    let dh1 = creds.identity.dh(&bundle.signed_pre_key);
    let dh2 = ephemeral.dh(&bundle.identity);
    let dh3 = ephemeral.dh(&bundle.signed_pre_key);
    let dh4 = bundle.pre_key.as_ref().map(|pre_key| ephemeral.dh(pre_key));
    let (send_seed, recv_seed) = derive_chain_seeds(dh1, dh2, dh3, dh4);

    Ok(SessionRecord {
        send: ChainState::new(send_seed),
        recv: ChainState::new(recv_seed),
        pending: Some(EstablishHeader {
            identity: creds.identity.public(),
            ephemeral: ephemeral.public(),
            signed_pre_key_id: bundle.signed_pre_key_id,
            pre_key_id: bundle.pre_key_id,
        }),
    })
}

/// Responder half: derive the mirror-image session from an establishing
/// header and our private keys.
pub(crate) fn respond(
    header: &EstablishHeader,
    keys: &EstablishKeys,
) -> Result<SessionRecord, CryptoError> {
    let one_time = match header.pre_key_id {
        Some(id) => {
            Some(keys.one_time_pre_key.as_ref().ok_or(CryptoError::MissingPreKey { id })?)
        },
        None => None,
    };

    let dh1 = keys.signed_pre_key.dh(&header.identity);
    let dh2 = keys.identity.dh(&header.ephemeral);
    let dh3 = keys.signed_pre_key.dh(&header.ephemeral);
    let dh4 = one_time.map(|pre_key| pre_key.dh(&header.ephemeral));
    let (their_send_seed, our_send_seed) = derive_chain_seeds(dh1, dh2, dh3, dh4);

    Ok(SessionRecord {
        send: ChainState::new(our_send_seed),
        recv: ChainState::new(their_send_seed),
        pending: None,
    })
}

/// Encrypt on the session's send chain.
///
/// A pending establishing header is attached to this message and cleared, so
/// only the first outgoing message after establishment is tagged
/// [`MessageKind::Establishing`].
pub(crate) fn encrypt<R: CryptoRng + RngCore>(
    record: &mut SessionRecord,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<(MessageKind, Vec<u8>), CryptoError> {
    let message_key = record.send.advance()?;
    let (nonce, ciphertext) = seal::seal(&message_key, SESSION_CONTEXT, plaintext, rng);

    let header = record.pending.take();
    let kind =
        if header.is_some() { MessageKind::Establishing } else { MessageKind::Normal };
    let envelope =
        Envelope { generation: message_key.generation(), nonce, ciphertext, header };
    Ok((kind, seal::encode(&envelope, "message envelope")?))
}

/// Decrypt on the session's receive chain, establishing the session from the
/// message header when no record exists yet.
///
/// An existing record wins over a header: retransmitted establishing
/// messages decrypt on the already-derived chains.
pub(crate) fn decrypt(
    record: Option<SessionRecord>,
    payload: &[u8],
    establish: Option<&EstablishKeys>,
) -> Result<(SessionRecord, Vec<u8>), CryptoError> {
    let envelope: Envelope = seal::decode(payload, "message envelope")?;

    let mut record = match record {
        Some(record) => record,
        None => {
            let header = envelope.header.as_ref().ok_or_else(|| CryptoError::BadCiphertext {
                reason: "message carries no establishing header and no session exists"
                    .to_string(),
            })?;
            let keys = establish.ok_or_else(|| CryptoError::BadCiphertext {
                reason: "establishing message but no local handshake keys supplied".to_string(),
            })?;
            respond(header, keys)?
        },
    };

    let message_key = record.recv.advance_to(envelope.generation)?;
    let plaintext = seal::open(&message_key, &envelope.nonce, &envelope.ciphertext)?;
    Ok((record, plaintext))
}

/// One-time pre-key id named by an establishing payload, if any.
///
/// Cleartext header peek: lets the caller fetch and consume the pre-key
/// before running the handshake.
pub(crate) fn establishing_pre_key_id(payload: &[u8]) -> Result<Option<u32>, CryptoError> {
    let envelope: Envelope = seal::decode(payload, "message envelope")?;
    Ok(envelope.header.and_then(|header| header.pre_key_id))
}

/// HKDF the concatenated handshake secrets into the two chain seeds,
/// (initiator send, initiator recv).
fn derive_chain_seeds(
    dh1: [u8; 32],
    dh2: [u8; 32],
    dh3: [u8; 32],
    dh4: Option<[u8; 32]>,
) -> ([u8; 32], [u8; 32]) {
    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(SESSION_LABEL, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };
    ikm.zeroize();

    let mut send_seed = [0u8; 32];
    let mut recv_seed = [0u8; 32];
    send_seed.copy_from_slice(&okm[..32]);
    recv_seed.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (send_seed, recv_seed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::keys::SignedPreKeyRecord;

    fn creds() -> AccountCreds {
        let identity = KeyPair::generate(&mut OsRng);
        let spk = KeyPair::generate(&mut OsRng);
        let signature = identity.sign(&spk.public());
        AccountCreds {
            identity,
            signed_pre_key: SignedPreKeyRecord { id: 1, pair: spk, signature },
            registration_id: 42,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            advertised: false,
        }
    }

    fn establish_keys(creds: &AccountCreds, one_time: Option<KeyPair>) -> EstablishKeys {
        EstablishKeys {
            identity: creds.identity.clone(),
            signed_pre_key: creds.signed_pre_key.pair.clone(),
            one_time_pre_key: one_time,
        }
    }

    #[test]
    fn handshake_with_one_time_pre_key_roundtrips() {
        let alice = creds();
        let bob = creds();
        let otp = KeyPair::generate(&mut OsRng);
        let bundle = bob.bundle(Some((9, otp.public())));

        let mut outgoing = initiate(&alice, &bundle, KeyPair::generate(&mut OsRng)).unwrap();
        let (kind, payload) = encrypt(&mut outgoing, b"hi bob", &mut OsRng).unwrap();
        assert_eq!(kind, MessageKind::Establishing);
        assert_eq!(establishing_pre_key_id(&payload).unwrap(), Some(9));

        let keys = establish_keys(&bob, Some(otp));
        let (mut incoming, plaintext) = decrypt(None, &payload, Some(&keys)).unwrap();
        assert_eq!(plaintext, b"hi bob");

        // Reply flows on the mirrored chains.
        let (kind, reply) = encrypt(&mut incoming, b"hi alice", &mut OsRng).unwrap();
        assert_eq!(kind, MessageKind::Normal);
        let (_, plaintext) = decrypt(Some(outgoing), &reply, None).unwrap();
        assert_eq!(plaintext, b"hi alice");
    }

    #[test]
    fn handshake_without_one_time_pre_key_roundtrips() {
        let alice = creds();
        let bob = creds();
        let bundle = bob.bundle(None);

        let mut outgoing = initiate(&alice, &bundle, KeyPair::generate(&mut OsRng)).unwrap();
        let (_, payload) = encrypt(&mut outgoing, b"plain handshake", &mut OsRng).unwrap();
        assert_eq!(establishing_pre_key_id(&payload).unwrap(), None);

        let keys = establish_keys(&bob, None);
        let (_, plaintext) = decrypt(None, &payload, Some(&keys)).unwrap();
        assert_eq!(plaintext, b"plain handshake");
    }

    #[test]
    fn second_message_is_normal_kind() {
        let alice = creds();
        let bob = creds();
        let mut outgoing =
            initiate(&alice, &bob.bundle(None), KeyPair::generate(&mut OsRng)).unwrap();

        let (first, _) = encrypt(&mut outgoing, b"one", &mut OsRng).unwrap();
        let (second, _) = encrypt(&mut outgoing, b"two", &mut OsRng).unwrap();
        assert_eq!(first, MessageKind::Establishing);
        assert_eq!(second, MessageKind::Normal);
    }

    #[test]
    fn out_of_order_messages_decrypt() {
        let alice = creds();
        let bob = creds();
        let mut outgoing =
            initiate(&alice, &bob.bundle(None), KeyPair::generate(&mut OsRng)).unwrap();

        let (_, establishing) = encrypt(&mut outgoing, b"hello", &mut OsRng).unwrap();
        let keys = establish_keys(&bob, None);
        let (record, _) = decrypt(None, &establishing, Some(&keys)).unwrap();

        let (_, first) = encrypt(&mut outgoing, b"first", &mut OsRng).unwrap();
        let (_, second) = encrypt(&mut outgoing, b"second", &mut OsRng).unwrap();

        // The later message arrives first; the chain skips forward.
        let (record, plaintext) = decrypt(Some(record), &second, None).unwrap();
        assert_eq!(plaintext, b"second");
        // The earlier message's key was skipped past and is gone.
        assert!(decrypt(Some(record), &first, None).is_err());
    }

    #[test]
    fn missing_one_time_pre_key_is_reported() {
        let alice = creds();
        let bob = creds();
        let otp = KeyPair::generate(&mut OsRng);
        let bundle = bob.bundle(Some((7, otp.public())));

        let mut outgoing = initiate(&alice, &bundle, KeyPair::generate(&mut OsRng)).unwrap();
        let (_, payload) = encrypt(&mut outgoing, b"x", &mut OsRng).unwrap();

        let keys = establish_keys(&bob, None);
        let result = decrypt(None, &payload, Some(&keys));
        assert_eq!(result.err(), Some(CryptoError::MissingPreKey { id: 7 }));
    }

    #[test]
    fn retransmitted_establishing_message_uses_existing_session() {
        let alice = creds();
        let bob = creds();
        let mut outgoing =
            initiate(&alice, &bob.bundle(None), KeyPair::generate(&mut OsRng)).unwrap();
        let (_, payload) = encrypt(&mut outgoing, b"hello", &mut OsRng).unwrap();

        let keys = establish_keys(&bob, None);
        let (record, _) = decrypt(None, &payload, Some(&keys)).unwrap();

        // Delivered again: the stored record decrypts it without the keys.
        let result = decrypt(Some(record), &payload, None);
        assert!(result.is_err(), "skipped generation cannot be replayed");
    }

    #[test]
    fn tampered_bundle_is_rejected() {
        let alice = creds();
        let bob = creds();
        let mut bundle = bob.bundle(None);
        bundle.signed_pre_key = KeyPair::generate(&mut OsRng).public();

        let result = initiate(&alice, &bundle, KeyPair::generate(&mut OsRng));
        assert_eq!(result.err(), Some(CryptoError::InvalidSignature));
    }

    #[test]
    fn message_without_session_or_header_fails() {
        let alice = creds();
        let bob = creds();
        let mut outgoing =
            initiate(&alice, &bob.bundle(None), KeyPair::generate(&mut OsRng)).unwrap();
        encrypt(&mut outgoing, b"establishing", &mut OsRng).unwrap();
        let (_, normal) = encrypt(&mut outgoing, b"normal", &mut OsRng).unwrap();

        let result = decrypt(None, &normal, None);
        assert!(matches!(result, Err(CryptoError::BadCiphertext { .. })));
    }
}
