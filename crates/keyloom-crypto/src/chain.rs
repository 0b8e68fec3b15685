//! Forward-secure symmetric message chains.
//!
//! A chain derives a sequence of one-time message keys from a seed. Each
//! advance derives the key for the current generation, replaces the chain
//! key with its successor and overwrites the old one, so compromise of the
//! current state never reveals past keys.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key.
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key.
const MESSAGE_LABEL: &[u8] = b"message";

/// Maximum generations to skip when catching up to an out-of-order message.
const MAX_SKIP: u32 = 1000;

/// Persisted state of one chain: the current chain key and how many times it
/// has been advanced.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainState {
    key: [u8; 32],
    generation: u32,
}

impl ChainState {
    /// Start a chain at generation zero from a 32-byte seed.
    pub fn new(seed: [u8; 32]) -> Self {
        Self { key: seed, generation: 0 }
    }

    /// Number of times this chain has been advanced.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Derive the message key for the current generation and step the chain.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.generation == u32::MAX {
            return Err(CryptoError::GenerationOverflow { current: self.generation });
        }

        let message_key = derive(&self.key, MESSAGE_LABEL);
        let next_chain_key = derive(&self.key, CHAIN_LABEL);

        self.key.zeroize();
        self.key = next_chain_key;

        let current = self.generation;
        self.generation = self.generation.wrapping_add(1);

        Ok(MessageKey { key: message_key, generation: current })
    }

    /// Advance until the key for `target` is produced.
    ///
    /// Skipping is bounded by `MAX_SKIP`; a target behind the chain's
    /// current position is unreachable because the intermediate keys were
    /// already overwritten.
    pub fn advance_to(&mut self, target: u32) -> Result<MessageKey, CryptoError> {
        if target < self.generation {
            return Err(CryptoError::RatchetTooFarBehind {
                current: self.generation,
                requested: target,
            });
        }
        if target.wrapping_sub(self.generation) > MAX_SKIP {
            return Err(CryptoError::RatchetTooFarBehind {
                current: self.generation,
                requested: target,
            });
        }

        let mut message_key = None;
        while self.generation <= target {
            message_key = Some(self.advance()?);
        }
        message_key.ok_or(CryptoError::RatchetTooFarBehind {
            current: self.generation,
            requested: target,
        })
    }
}

impl Drop for ChainState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainState").field("generation", &self.generation).finish_non_exhaustive()
    }
}

/// A one-time message key. Use for a single seal or open, then drop.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    generation: u32,
}

impl MessageKey {
    /// 32-byte key for XChaCha20-Poly1305.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain generation this key was derived at.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey").field("generation", &self.generation).finish_non_exhaustive()
    }
}

fn derive(chain_key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(chain_key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}
