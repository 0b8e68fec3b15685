//! Closed enumeration of stored key namespaces.
//!
//! The persistent store is partitioned into five logical namespaces. Using a
//! closed enum instead of open string keys gives compile-time exhaustiveness
//! over every store operation and a canonical ordering for lock acquisition.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Logical namespace of a stored entry.
///
/// Each variant maps to one `(type, id) -> blob` table in the persistent
/// store. The canonical string names are part of the store contract and must
/// not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyType {
    /// Long-term identity key pair for the local account.
    Identity,

    /// Serialized ratchet state for a 1:1 channel, keyed by peer address.
    Session,

    /// Single-use pre-key, keyed by numeric id.
    PreKey,

    /// The current medium-lived signed pre-key.
    SignedPreKey,

    /// Group ratchet state, keyed by sender-key name.
    SenderKey,
}

impl KeyType {
    /// All key types, in canonical name order.
    ///
    /// This is also the lock acquisition order for multi-type batches.
    pub const ALL: [Self; 5] =
        [Self::Identity, Self::PreKey, Self::SenderKey, Self::Session, Self::SignedPreKey];

    /// Canonical store name for this key type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Session => "session",
            Self::PreKey => "pre-key",
            Self::SignedPreKey => "signed-pre-key",
            Self::SenderKey => "sender-key",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized key-type names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown key type: {0}")]
pub struct UnknownKeyType(pub String);

impl FromStr for KeyType {
    type Err = UnknownKeyType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "session" => Ok(Self::Session),
            "pre-key" => Ok(Self::PreKey),
            "signed-pre-key" => Ok(Self::SignedPreKey),
            "sender-key" => Ok(Self::SenderKey),
            other => Err(UnknownKeyType(other.to_string())),
        }
    }
}

impl TryFrom<String> for KeyType {
    type Error = UnknownKeyType;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<KeyType> for String {
    fn from(t: KeyType) -> Self {
        t.as_str().to_string()
    }
}
