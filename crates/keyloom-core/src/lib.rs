//! Keyloom Core
//!
//! Shared model for the Keyloom session store: the closed set of key types,
//! protocol addresses, mutation patches, and the persistent-store contract
//! every higher layer builds on.
//!
//! # Architecture
//!
//! The store speaks one narrow contract: `(key type, id) -> blob | absent`,
//! batched per key type. Everything above it — caching, transactions, the
//! session repository — composes on top of [`KeyStore`] without knowing what
//! backs it (disk, database, or the in-memory implementation shipped here for
//! tests).
//!
//! # Components
//!
//! - [`KeyType`]: closed enumeration of the five stored namespaces
//! - [`ProtocolAddress`] / [`SenderKeyName`]: typed ids for sessions and
//!   group sender keys
//! - [`KeyPatch`]: a batched set of writes and deletions
//! - [`KeyStore`]: the persistent-store trait, with [`MemoryKeyStore`] for
//!   testing and simulation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod address;
mod error;
mod key_type;
mod patch;
mod store;

pub use address::{AddressError, ProtocolAddress, SenderKeyName};
pub use error::StoreError;
pub use key_type::KeyType;
pub use patch::KeyPatch;
pub use store::{KeyStore, MemoryKeyStore};
