use thiserror::Error;

use crate::serde::CanonicalJsonError;

/// Errors arising while hashing, signing or verifying events and JSON
/// objects.
#[derive(Error, Debug)]
pub enum Error {
    #[error("canonical JSON: {0}")]
    Canonical(#[from] CanonicalJsonError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("invalid signing key id `{0}`")]
    InvalidKeyId(String),

    #[error("unsupported signature algorithm `{0}`")]
    UnsupportedAlgorithm(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("malformed object: {0}")]
    Malformed(String),
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Why verification of a signature failed.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The object carries no signature for the entity being checked.
    #[error("no signature found for `{0}`")]
    SignatureNotFound(String),

    /// None of the entity's signature key ids resolve to a known key.
    #[error("no known key for any signature of `{0}`")]
    UnknownKey(String),

    /// A signature was made with a key that expired before the data was
    /// created.
    #[error("signature of `{0}` was made with an expired key")]
    KeyExpired(String),

    /// The cryptographic check itself failed.
    #[error("signature verification failed for `{0}`")]
    SignatureVerificationFailed(String),
}
