//! Key pairs, signed pre-keys and peer bundles.
//!
//! One 32-byte secret backs both roles of an identity: X25519 for agreement
//! and Ed25519 for signed pre-key signatures. Secrets are zeroized on drop.

use ed25519_dalek::{Signer, Verifier};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// An X25519 key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl KeyPair {
    /// Generate a fresh pair from the given randomness source.
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret: secret.to_bytes(), public: public.to_bytes() }
    }

    /// Rebuild a pair from its secret bytes.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let clamped = StaticSecret::from(secret);
        let public = PublicKey::from(&clamped);
        Self { secret: clamped.to_bytes(), public: public.to_bytes() }
    }

    /// Public key bytes.
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// X25519 agreement with a peer's public key.
    pub fn dh(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret);
        secret.diffie_hellman(&PublicKey::from(*peer_public)).to_bytes()
    }

    /// Sign `data` with the Ed25519 key derived from this pair's secret.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signing = ed25519_dalek::SigningKey::from_bytes(&self.secret);
        signing.sign(data).to_bytes().to_vec()
    }

    /// Ed25519 verifying key matching [`sign`](Self::sign).
    pub fn signing_public(&self) -> [u8; 32] {
        let signing = ed25519_dalek::SigningKey::from_bytes(&self.secret);
        signing.verifying_key().to_bytes()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret bytes stay out of logs.
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature over `data`.
pub fn verify(
    signing_public: &[u8; 32],
    data: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(signing_public)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = ed25519_dalek::Signature::from_slice(signature)
        .map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(data, &signature).map_err(|_| CryptoError::InvalidSignature)
}

/// A signed pre-key: a medium-term pair whose public half is signed by the
/// account identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Rotating id of this signed pre-key.
    pub id: u32,
    /// The key pair itself.
    pub pair: KeyPair,
    /// Ed25519 signature by the identity over the public key.
    pub signature: Vec<u8>,
}

/// The public key material a peer publishes for session establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerKeyBundle {
    /// Peer's X25519 identity public key.
    pub identity: [u8; 32],
    /// Peer's Ed25519 verifying key.
    pub signing_key: [u8; 32],
    /// Id of the signed pre-key below.
    pub signed_pre_key_id: u32,
    /// Signed pre-key public key.
    pub signed_pre_key: [u8; 32],
    /// Identity signature over the signed pre-key.
    pub signed_pre_key_signature: Vec<u8>,
    /// Id of the one-time pre-key, if the server handed one out.
    pub pre_key_id: Option<u32>,
    /// One-time pre-key public key.
    pub pre_key: Option<[u8; 32]>,
}

impl PeerKeyBundle {
    /// Check the signed pre-key signature against the bundle's signing key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        verify(&self.signing_key, &self.signed_pre_key, &self.signed_pre_key_signature)
    }
}
