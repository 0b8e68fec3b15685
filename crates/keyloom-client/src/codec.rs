//! CBOR codec for pre-key records stored as opaque blobs.

use bytes::Bytes;
use keyloom_core::StoreError;
use keyloom_crypto::KeyPair;

pub(crate) fn encode_pre_key(pair: &KeyPair) -> Result<Bytes, StoreError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(pair, &mut out)
        .map_err(|err| StoreError::Backend(format!("failed to encode pre-key: {err}")))?;
    Ok(Bytes::from(out))
}

pub(crate) fn decode_pre_key(id: &str, bytes: &[u8]) -> Result<KeyPair, StoreError> {
    ciborium::de::from_reader(bytes)
        .map_err(|_| StoreError::Decode { key_type: "pre-key", id: id.to_string() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pre_key_codec_round_trips() {
        let pair = KeyPair::from_secret([5u8; 32]);
        let encoded = encode_pre_key(&pair).unwrap();
        let decoded = decode_pre_key("1", &encoded).unwrap();
        assert_eq!(pair.public(), decoded.public());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_pre_key("7", b"junk").unwrap_err();
        assert_eq!(err, StoreError::Decode { key_type: "pre-key", id: "7".to_string() });
    }
}
