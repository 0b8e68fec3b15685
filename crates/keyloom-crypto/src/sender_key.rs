//! Sender-key group messaging.
//!
//! Each group member owns one sender-key chain per group. The chain state is
//! shared with other members through a distribution message (a snapshot of
//! the distribution id, chain key and generation); receivers re-seed their
//! copy of the sender's record from it and then advance generation by
//! generation as messages arrive.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::chain::ChainState;
use crate::error::CryptoError;
use crate::seal;

/// Persisted per-sender group chain.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SenderKeyRecord {
    /// Random id tying messages to this chain lineage.
    distribution_id: [u8; 32],
    chain: ChainState,
}

/// The shareable snapshot of a sender-key chain.
#[derive(Serialize, Deserialize)]
struct DistributionMessage {
    distribution_id: [u8; 32],
    chain: ChainState,
}

#[derive(Serialize, Deserialize)]
struct GroupEnvelope {
    generation: u32,
    nonce: [u8; 24],
    ciphertext: Vec<u8>,
}

impl SenderKeyRecord {
    /// Create a fresh chain with a random distribution id and seed.
    pub(crate) fn create<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let mut distribution_id = [0u8; 32];
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut distribution_id);
        rng.fill_bytes(&mut seed);
        Self { distribution_id, chain: ChainState::new(seed) }
    }

    fn nonce_context(&self) -> [u8; 8] {
        let mut context = [0u8; 8];
        context.copy_from_slice(&self.distribution_id[..8]);
        context
    }
}

/// Snapshot the record (creating it first when absent) into a distribution
/// payload other members can apply.
pub(crate) fn build_distribution<R: CryptoRng + RngCore>(
    record: Option<&[u8]>,
    rng: &mut R,
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let record = match record {
        Some(bytes) => seal::decode::<SenderKeyRecord>(bytes, "sender key")?,
        None => SenderKeyRecord::create(rng),
    };

    let message = DistributionMessage {
        distribution_id: record.distribution_id,
        chain: record.chain.clone(),
    };
    let payload = seal::encode(&message, "sender key distribution")?;
    let record_bytes = seal::encode(&record, "sender key")?;
    Ok((record_bytes, payload))
}

/// Re-seed a sender's record from a distribution payload.
///
/// The payload replaces any existing record wholesale; a sender that rotated
/// its chain distributes a new snapshot and receivers follow.
pub(crate) fn apply_distribution(payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let message: DistributionMessage =
        seal::decode(payload, "sender key").map_err(|_| CryptoError::MalformedDistribution)?;

    let record =
        SenderKeyRecord { distribution_id: message.distribution_id, chain: message.chain };
    seal::encode(&record, "sender key")
}

/// Encrypt on our own group chain, advancing it by one generation.
pub(crate) fn encrypt<R: CryptoRng + RngCore>(
    record: &[u8],
    plaintext: &[u8],
    rng: &mut R,
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut record: SenderKeyRecord = seal::decode(record, "sender key")?;
    let message_key = record.chain.advance()?;
    let (nonce, ciphertext) = seal::seal(&message_key, record.nonce_context(), plaintext, rng);

    let envelope = GroupEnvelope { generation: message_key.generation(), nonce, ciphertext };
    let payload = seal::encode(&envelope, "group envelope")?;
    let record_bytes = seal::encode(&record, "sender key")?;
    Ok((record_bytes, payload))
}

/// Decrypt a group message on the sender's synchronized chain, skipping
/// forward to the message's generation when deliveries arrive out of order.
pub(crate) fn decrypt(record: &[u8], payload: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut record: SenderKeyRecord = seal::decode(record, "sender key")?;
    let envelope: GroupEnvelope = seal::decode(payload, "group envelope")?;

    let message_key = record.chain.advance_to(envelope.generation)?;
    let plaintext = seal::open(&message_key, &envelope.nonce, &envelope.ciphertext)?;
    let record_bytes = seal::encode(&record, "sender key")?;
    Ok((record_bytes, plaintext))
}
