use std::collections::BTreeMap;
use std::fmt;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::RngCore;

use super::error::Error;
use crate::identifiers::{OwnedServerSigningKeyId, ServerSigningKeyId};

/// Public keys of one entity, keyed by signing key id; values are unpadded
/// standard Base64.
pub type PublicKeySet = BTreeMap<String, String>;

/// Public keys of many entities, keyed by entity (server) name.
pub type PublicKeyMap = BTreeMap<String, PublicKeySet>;

/// An Ed25519 signing key pair together with its version string.
///
/// The key id is `ed25519:<version>`.
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
    version: String,
}

impl Ed25519KeyPair {
    /// Generates a fresh key pair.
    pub fn generate(version: impl Into<String>) -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
            version: version.into(),
        }
    }

    /// Restores a key pair from its 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8], version: impl Into<String>) -> Result<Self, Error> {
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| Error::InvalidKey("ed25519 secret must be 32 bytes".to_owned()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
            version: version.into(),
        })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The public key as unpadded Base64, the form published at
    /// `/key/v2/server`.
    pub fn public_key_base64(&self) -> String {
        crate::serde::base64_encode(self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn key_id(&self) -> OwnedServerSigningKeyId {
        ServerSigningKeyId::from_version(&self.version).expect("key version is validated")
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Decodes an unpadded-Base64 public key into a verifier.
pub(super) fn verifying_key(encoded: &str) -> Result<VerifyingKey, Error> {
    let bytes = crate::serde::base64_decode(encoded)
        .map_err(|e| Error::Base64(format!("public key: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidKey("ed25519 public key must be 32 bytes".to_owned()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::Ed25519KeyPair;

    #[test]
    fn round_trips_secret() {
        let pair = Ed25519KeyPair::generate("a1");
        let restored = Ed25519KeyPair::from_secret_bytes(&pair.secret_bytes(), "a1").unwrap();
        assert_eq!(pair.public_key(), restored.public_key());
        assert_eq!(pair.key_id().as_str(), "ed25519:a1");
    }

    #[test]
    fn rejects_bad_secret_length() {
        assert!(Ed25519KeyPair::from_secret_bytes(&[0u8; 31], "x").is_err());
    }
}
