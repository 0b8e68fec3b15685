//! Account credentials created at provisioning.

use serde::{Deserialize, Serialize};

use crate::keys::{KeyPair, PeerKeyBundle, SignedPreKeyRecord};

/// Long-lived cryptographic state of one account/device.
///
/// Created once by [`provision_creds`](crate::provision_creds) and persisted
/// by the caller. The pre-key counters are advanced by the allocator through
/// [`CredsUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCreds {
    /// Identity key pair (X25519 agreement + derived Ed25519 signing).
    pub identity: KeyPair,
    /// Current signed pre-key.
    pub signed_pre_key: SignedPreKeyRecord,
    /// Registration id advertised to the server.
    pub registration_id: u32,
    /// Id the next generated one-time pre-key will take.
    pub next_pre_key_id: u32,
    /// First one-time pre-key id not yet uploaded to the server.
    pub first_unuploaded_pre_key_id: u32,
    /// Whether this device's bundle has been published.
    pub advertised: bool,
}

impl AccountCreds {
    /// Build the public bundle peers use to establish sessions with us,
    /// optionally carrying one one-time pre-key.
    pub fn bundle(&self, one_time_pre_key: Option<(u32, [u8; 32])>) -> PeerKeyBundle {
        PeerKeyBundle {
            identity: self.identity.public(),
            signing_key: self.identity.signing_public(),
            signed_pre_key_id: self.signed_pre_key.id,
            signed_pre_key: self.signed_pre_key.pair.public(),
            signed_pre_key_signature: self.signed_pre_key.signature.clone(),
            pre_key_id: one_time_pre_key.map(|(id, _)| id),
            pre_key: one_time_pre_key.map(|(_, key)| key),
        }
    }
}

/// Counter advance produced by a pre-key allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredsUpdate {
    /// New value for [`AccountCreds::next_pre_key_id`].
    pub next_pre_key_id: u32,
    /// New value for [`AccountCreds::first_unuploaded_pre_key_id`].
    pub first_unuploaded_pre_key_id: u32,
}

impl CredsUpdate {
    /// Fold the update into the credentials.
    pub fn apply(&self, creds: &mut AccountCreds) {
        creds.next_pre_key_id = self.next_pre_key_id;
        creds.first_unuploaded_pre_key_id = self.first_unuploaded_pre_key_id;
    }
}
