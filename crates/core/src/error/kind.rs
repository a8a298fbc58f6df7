use std::fmt;
use std::time::Duration;

use crate::RoomVersionId;

/// The machine-readable error code of a Matrix error response.
///
/// This is a closed set; anything the server cannot classify is reported as
/// [`ErrorKind::Unknown`] with a diagnostic message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// M_FORBIDDEN
    Forbidden,

    /// M_UNKNOWN_TOKEN
    UnknownToken {
        /// Whether the client can recover by re-logging in without losing
        /// device state.
        soft_logout: bool,
    },

    /// M_MISSING_TOKEN
    MissingToken,

    /// M_NOT_FOUND
    NotFound,

    /// M_BAD_JSON
    BadJson,

    /// M_NOT_JSON
    NotJson,

    /// M_INVALID_PARAM
    InvalidParam,

    /// M_MISSING_PARAM
    MissingParam,

    /// M_LIMIT_EXCEEDED
    LimitExceeded { retry_after_ms: Option<Duration> },

    /// M_TOO_LARGE
    TooLarge,

    /// M_UNSUPPORTED_ROOM_VERSION
    UnsupportedRoomVersion,

    /// M_INCOMPATIBLE_ROOM_VERSION
    IncompatibleRoomVersion { room_version: RoomVersionId },

    /// M_UNRECOGNIZED
    Unrecognized,

    /// M_UNAUTHORIZED
    Unauthorized,

    /// M_BAD_STATE
    BadState,

    /// M_UNABLE_TO_AUTHORISE_JOIN
    UnableToAuthorizeJoin,

    /// M_UNABLE_TO_GRANT_JOIN
    UnableToGrantJoin,

    /// M_UNKNOWN
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forbidden => "M_FORBIDDEN",
            Self::UnknownToken { .. } => "M_UNKNOWN_TOKEN",
            Self::MissingToken => "M_MISSING_TOKEN",
            Self::NotFound => "M_NOT_FOUND",
            Self::BadJson => "M_BAD_JSON",
            Self::NotJson => "M_NOT_JSON",
            Self::InvalidParam => "M_INVALID_PARAM",
            Self::MissingParam => "M_MISSING_PARAM",
            Self::LimitExceeded { .. } => "M_LIMIT_EXCEEDED",
            Self::TooLarge => "M_TOO_LARGE",
            Self::UnsupportedRoomVersion => "M_UNSUPPORTED_ROOM_VERSION",
            Self::IncompatibleRoomVersion { .. } => "M_INCOMPATIBLE_ROOM_VERSION",
            Self::Unrecognized => "M_UNRECOGNIZED",
            Self::Unauthorized => "M_UNAUTHORIZED",
            Self::BadState => "M_BAD_STATE",
            Self::UnableToAuthorizeJoin => "M_UNABLE_TO_AUTHORISE_JOIN",
            Self::UnableToGrantJoin => "M_UNABLE_TO_GRANT_JOIN",
            Self::Unknown => "M_UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
