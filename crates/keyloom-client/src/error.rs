//! Repository error types.

use keyloom_core::{ProtocolAddress, SenderKeyName, StoreError};
use keyloom_crypto::CryptoError;
use thiserror::Error;

/// Errors from session repository and pre-key allocator operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// A normal message arrived for a peer with no stored session.
    #[error("no session with {0}")]
    NoSession(ProtocolAddress),

    /// A group message arrived before the sender's distribution message.
    #[error("no sender key for {0}")]
    NoSenderKey(SenderKeyName),

    /// A sender-key distribution message arrived without a group id.
    #[error("sender key distribution message without a group id")]
    MissingGroupId,

    /// A message carried a kind tag the repository does not understand.
    #[error("unknown message type tag {tag:?}")]
    UnknownMessageType {
        /// The unrecognized tag.
        tag: String,
    },

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_subject() {
        let addr = ProtocolAddress::new("alice", 0);
        assert!(RepositoryError::NoSession(addr).to_string().contains("alice.0"));

        let err = RepositoryError::UnknownMessageType { tag: "blob".to_string() };
        assert!(err.to_string().contains("blob"));
    }

    #[test]
    fn store_errors_convert() {
        let err: RepositoryError = StoreError::Io("disk".to_string()).into();
        assert!(matches!(err, RepositoryError::Store(_)));
    }
}
