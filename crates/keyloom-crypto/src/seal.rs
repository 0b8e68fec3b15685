//! XChaCha20-Poly1305 sealing and CBOR record codecs.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand::{CryptoRng, RngCore};
use serde::{Serialize, de::DeserializeOwned};

use crate::chain::MessageKey;
use crate::error::CryptoError;

/// Length of the caller-visible random nonce suffix.
const NONCE_RANDOM_SIZE: usize = 12;

/// Seal `plaintext` under a one-time message key.
///
/// The 24-byte nonce binds the chain position: an 8-byte context prefix,
/// the big-endian generation, and a random suffix. Each message key is used
/// exactly once, so the nonce only needs to be unique per key; the random
/// suffix is extra margin.
pub(crate) fn seal<R: CryptoRng + RngCore>(
    message_key: &MessageKey,
    context: [u8; 8],
    plaintext: &[u8],
    rng: &mut R,
) -> ([u8; 24], Vec<u8>) {
    let mut random_suffix = [0u8; NONCE_RANDOM_SIZE];
    rng.fill_bytes(&mut random_suffix);
    let nonce = build_nonce(context, message_key.generation(), random_suffix);

    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    (nonce, ciphertext)
}

/// Open a sealed payload with its one-time message key.
pub(crate) fn open(
    message_key: &MessageKey,
    nonce: &[u8; 24],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| {
        CryptoError::BadCiphertext { reason: "authentication failed".to_string() }
    })
}

fn build_nonce(context: [u8; 8], generation: u32, random_suffix: [u8; 12]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..8].copy_from_slice(&context);
    nonce[8..12].copy_from_slice(&generation.to_be_bytes());
    nonce[12..24].copy_from_slice(&random_suffix);
    nonce
}

/// Encode a record or envelope as CBOR.
pub(crate) fn encode<T: Serialize>(value: &T, kind: &'static str) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|_| CryptoError::Encode { kind })?;
    Ok(out)
}

/// Decode a CBOR record or envelope.
pub(crate) fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    kind: &'static str,
) -> Result<T, CryptoError> {
    ciborium::de::from_reader(bytes).map_err(|_| CryptoError::MalformedRecord { kind })
}
