//! Error types for the store contract.
//!
//! Strongly-typed errors for persistence and commit failures. Direct
//! (non-transactional) store failures propagate unmodified; only transaction
//! commits are retried, and exhausting those retries surfaces
//! [`StoreError::CommitFailed`].

use thiserror::Error;

/// Errors from the persistent store and the layers that wrap it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// I/O failure in the backing store.
    #[error("store i/o error: {0}")]
    Io(String),

    /// Backend-specific failure (corruption, closed handle, quota).
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored blob could not be decoded.
    #[error("failed to decode stored {key_type} record {id}")]
    Decode {
        /// Key type of the undecodable record.
        key_type: &'static str,
        /// Store id of the undecodable record.
        id: String,
    },

    /// A transaction commit failed after exhausting its retry budget.
    ///
    /// The mutation batch was not durably applied. Callers should treat the
    /// affected session state as unmodified.
    #[error("transaction commit failed after {attempts} attempts: {last_error}")]
    CommitFailed {
        /// Number of commit attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: String,
    },
}

impl StoreError {
    /// True if this error may succeed on retry.
    ///
    /// Decode failures and exhausted commits are not transient; plain I/O and
    /// backend failures may be.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Backend(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        assert!(StoreError::Io("connection reset".to_string()).is_transient());
        assert!(StoreError::Backend("busy".to_string()).is_transient());
    }

    #[test]
    fn commit_exhaustion_is_fatal() {
        let err = StoreError::CommitFailed { attempts: 5, last_error: "disk full".to_string() };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn decode_failures_are_fatal() {
        let err = StoreError::Decode { key_type: "session", id: "alice.0".to_string() };
        assert!(!err.is_transient());
    }
}
