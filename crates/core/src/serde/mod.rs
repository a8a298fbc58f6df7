//! Serialization helpers: canonical JSON, unpadded Base64 and a few serde
//! adapters shared by the wire types.

mod canonical;
pub mod pdu_process_response;

pub use canonical::{
    CanonicalJsonError, CanonicalJsonObject, CanonicalJsonValue, canonical_json_bytes,
    from_canonical_object, to_canonical_object, to_canonical_string, to_canonical_value,
    try_from_json_map,
};
pub use serde_json::Value as JsonValue;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use rand::Rng;

/// Encodes bytes as unpadded standard-alphabet Base64, the encoding used for
/// hashes, signatures and published keys.
pub fn base64_encode(data: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(data)
}

pub fn base64_decode(s: impl AsRef<[u8]>) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_NO_PAD.decode(s)
}

/// Encodes bytes as unpadded url-safe Base64, the encoding used for event
/// ids derived from reference hashes.
pub fn base64_encode_url_safe(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64_decode_url_safe(s: impl AsRef<[u8]>) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}

/// A random alphanumeric string, used for generated localparts and
/// transaction ids.
pub fn random_string(length: usize) -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn default_false() -> bool {
    false
}

pub fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

#[cfg(test)]
mod tests {
    use super::{base64_decode, base64_encode, base64_encode_url_safe};

    #[test]
    fn base64_is_unpadded() {
        assert_eq!(base64_encode([0xff, 0xfe, 0xfd]), "//79");
        assert_eq!(base64_encode_url_safe([0xff, 0xfe, 0xfd]), "__79");
        assert_eq!(base64_encode(b"ab"), "YWI");
        assert_eq!(base64_decode("YWI").unwrap(), b"ab");
        assert!(base64_decode("YWI=").is_err());
    }
}
