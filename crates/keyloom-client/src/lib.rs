//! Keyloom Client
//!
//! The client-facing layer of the Keyloom session store: a
//! [`SessionRepository`] for 1:1 and group messaging over the transactional
//! cached store, and a [`PreKeyAllocator`] for one-time pre-key management.
//!
//! # Components
//!
//! - [`SessionRepository`]: encrypt/decrypt pairwise and group messages,
//!   session establishment, sender-key distribution
//! - [`PreKeyAllocator`]: deterministic pre-key ids, paced generation,
//!   upload batching
//! - [`LidMapping`]: identity-aliasing seam, passthrough by default
//!
//! All durable state flows through a
//! [`keyloom_store::TransactionCoordinator`]; cryptography is injected
//! behind [`keyloom_crypto::CryptoEngine`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod codec;
mod error;
mod prekeys;
mod repository;
mod session_cache;

pub use error::RepositoryError;
pub use prekeys::{PreKeyAllocator, PreKeyBatch};
pub use repository::{
    GroupEncrypted, LidMapping, PassthroughLidMapping, SessionRepository, SessionStatus,
    SharedCreds,
};
