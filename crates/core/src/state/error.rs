use thiserror::Error;

/// Errors produced by the auth rules engine and the state resolver.
#[derive(Error, Debug)]
pub enum StateError {
    /// A referenced event could not be found.
    #[error("event not found: {0}")]
    NotFound(String),

    /// The event is rejected by the authorization rules; the message is the
    /// sub-reason.
    #[error("authorization failed: {0}")]
    AuthFailed(String),

    /// The event or one of its fields could not be interpreted.
    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    /// Behaviour required by a room version this implementation lacks.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl StateError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    pub fn invalid_pdu(msg: impl Into<String>) -> Self {
        Self::InvalidPdu(msg.into())
    }
}
