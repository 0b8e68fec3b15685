//! Error types for the cryptographic engine.
//!
//! Engine operations are value-in/value-out: a failed operation returns an
//! error and leaves the caller's persisted record untouched. None of these
//! errors is retried automatically.

use thiserror::Error;

/// Errors from session and sender-key operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Authentication failed or the ciphertext is corrupt.
    #[error("decryption failed: {reason}")]
    BadCiphertext {
        /// Why decryption failed.
        reason: String,
    },

    /// A message referenced a chain position the ratchet cannot reach.
    #[error("ratchet at generation {current} cannot produce key for {requested}")]
    RatchetTooFarBehind {
        /// The chain's current generation.
        current: u32,
        /// The generation the message was encrypted at.
        requested: u32,
    },

    /// The chain generation counter is exhausted.
    #[error("ratchet generation overflow at {current}")]
    GenerationOverflow {
        /// The generation at which the chain ran out.
        current: u32,
    },

    /// A stored session or sender-key record could not be decoded.
    #[error("malformed {kind} record")]
    MalformedRecord {
        /// What kind of record failed to decode.
        kind: &'static str,
    },

    /// A sender-key distribution payload could not be decoded.
    #[error("malformed sender key distribution message")]
    MalformedDistribution,

    /// An establishing message named a one-time pre-key that was not supplied.
    #[error("missing one-time pre-key {id}")]
    MissingPreKey {
        /// The pre-key id the message was built against.
        id: u32,
    },

    /// A signed pre-key signature did not verify against the peer's
    /// signing key.
    #[error("invalid signed pre-key signature")]
    InvalidSignature,

    /// A record could not be serialized.
    #[error("failed to encode {kind} record")]
    Encode {
        /// What kind of record failed to encode.
        kind: &'static str,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_context() {
        let err = CryptoError::RatchetTooFarBehind { current: 7, requested: 3 };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains('3'));

        let err = CryptoError::MalformedRecord { kind: "session" };
        assert!(err.to_string().contains("session"));
    }
}
