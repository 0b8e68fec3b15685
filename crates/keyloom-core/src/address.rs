//! Typed addresses for sessions and group sender keys.
//!
//! A 1:1 session is addressed by `(user, device)`; a group sender key by
//! `(group, user, device)`. The display forms double as store ids, so they
//! are part of the persistence contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Address of a single device belonging to a user.
///
/// Store id form: `user.device` (e.g. `alice.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolAddress {
    user: String,
    device: u32,
}

impl ProtocolAddress {
    /// Create an address from a user identifier and device number.
    pub fn new(user: impl Into<String>, device: u32) -> Self {
        Self { user: user.into(), device }
    }

    /// User identifier.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Device number. `0` is the primary device.
    pub fn device(&self) -> u32 {
        self.device
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user, self.device)
    }
}

/// Errors from parsing address strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Missing or malformed device suffix.
    #[error("malformed protocol address: {0}")]
    MalformedAddress(String),

    /// Missing group separator in a sender-key name.
    #[error("malformed sender key name: {0}")]
    MalformedSenderKeyName(String),
}

impl FromStr for ProtocolAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, device) =
            s.rsplit_once('.').ok_or_else(|| AddressError::MalformedAddress(s.to_string()))?;
        let device =
            device.parse().map_err(|_| AddressError::MalformedAddress(s.to_string()))?;
        Ok(Self::new(user, device))
    }
}

/// Identity of a group ratchet: which sender in which group.
///
/// Store id form: `group::user.device`. The same string keys the
/// per-sender-key lock, so two groups never serialize against each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderKeyName {
    group_id: String,
    sender: ProtocolAddress,
}

impl SenderKeyName {
    /// Create a sender-key name for a sender within a group.
    pub fn new(group_id: impl Into<String>, sender: ProtocolAddress) -> Self {
        Self { group_id: group_id.into(), sender }
    }

    /// Group identifier.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// The sending device.
    pub fn sender(&self) -> &ProtocolAddress {
        &self.sender
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group_id, self.sender)
    }
}

impl FromStr for SenderKeyName {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, sender) = s
            .split_once("::")
            .ok_or_else(|| AddressError::MalformedSenderKeyName(s.to_string()))?;
        let sender = sender
            .parse()
            .map_err(|_| AddressError::MalformedSenderKeyName(s.to_string()))?;
        Ok(Self::new(group, sender))
    }
}
