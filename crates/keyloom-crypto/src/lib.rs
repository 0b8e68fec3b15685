//! Keyloom Cryptographic Engine
//!
//! Sessions and sender keys for the Keyloom client, behind the
//! [`CryptoEngine`] capability trait. Records travel as opaque CBOR blobs so
//! the storage layers never depend on their shape.
//!
//! # Key Lifecycle
//!
//! ```text
//! Identity / Signed Pre-Key / One-Time Pre-Key     (X3DH handshake)
//!        │
//!        ▼
//! HKDF → Chain Seeds (send + receive, per session)
//!        │
//!        ▼
//! Symmetric Chain → Message Keys   (one per generation)
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext     (XChaCha20-Poly1305)
//! ```
//!
//! Sender keys follow the same chain construction, seeded per (group,
//! sender) and synchronized through distribution messages.
//!
//! # Security
//!
//! Forward secrecy:
//! - Chain advancement: old chain keys are zeroized after deriving the next
//! - Message keys are used for exactly one operation and then dropped
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD; the nonce binds context and chain position
//! - Signed pre-keys carry an identity signature verified before handshaking
//!
//! A failed operation returns an error without touching the input record, so
//! callers can persist records only on success.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod chain;
mod creds;
mod engine;
mod error;
mod keys;
mod seal;
mod sender_key;
mod session;

pub use chain::{ChainState, MessageKey};
pub use creds::{AccountCreds, CredsUpdate};
pub use engine::{CryptoEngine, DefaultEngine, SealedMessage, provision_creds};
pub use error::CryptoError;
pub use keys::{KeyPair, PeerKeyBundle, SignedPreKeyRecord, verify};
pub use session::{EstablishKeys, MessageKind};
