//! The error type returned over both APIs.

use std::error::Error as StdError;
use std::fmt;
use std::iter::FromIterator;
use std::time::Duration;

use salvo::http::{StatusCode, header};
use salvo::writing::Scribe;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue, json};

mod kind;
pub use kind::ErrorKind;

use crate::RoomVersionId;

macro_rules! simple_kind_fns {
    ($($fname:ident, $kind:ident;)+) => {
        $(
            /// Create a new `MatrixError`.
            pub fn $fname(body: impl Into<ErrorBody>) -> Self {
                Self::new(ErrorKind::$kind, body)
            }
        )+
    }
}

/// The response body of a Matrix error: the diagnostic `error` message plus
/// any kind-specific extra fields. The `errcode` field is added when the
/// error is rendered.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ErrorBody(JsonMap<String, JsonValue>);

impl From<String> for ErrorBody {
    fn from(message: String) -> Self {
        Self(JsonMap::from_iter([("error".to_owned(), json!(message))]))
    }
}

impl From<&str> for ErrorBody {
    fn from(message: &str) -> Self {
        Self(JsonMap::from_iter([("error".to_owned(), json!(message))]))
    }
}

impl From<JsonMap<String, JsonValue>> for ErrorBody {
    fn from(inner: JsonMap<String, JsonValue>) -> Self {
        Self(inner)
    }
}

impl ErrorBody {
    /// The diagnostic `error` message, if one is set.
    pub fn message(&self) -> Option<&str> {
        self.0.get("error").and_then(JsonValue::as_str)
    }
}

/// A Matrix error: an errcode from the closed set plus a diagnostic body.
#[derive(Debug, Clone)]
pub struct MatrixError {
    /// An explicit http status, overriding the kind's default mapping.
    pub status_code: Option<StatusCode>,

    pub kind: ErrorKind,

    pub body: ErrorBody,
}

impl MatrixError {
    pub fn new(kind: ErrorKind, body: impl Into<ErrorBody>) -> Self {
        Self {
            status_code: None,
            kind,
            body: body.into(),
        }
    }

    simple_kind_fns! {
        forbidden, Forbidden;
        missing_token, MissingToken;
        not_found, NotFound;
        bad_json, BadJson;
        not_json, NotJson;
        invalid_param, InvalidParam;
        missing_param, MissingParam;
        too_large, TooLarge;
        unsupported_room_version, UnsupportedRoomVersion;
        unrecognized, Unrecognized;
        unauthorized, Unauthorized;
        bad_state, BadState;
        unable_to_authorize_join, UnableToAuthorizeJoin;
        unable_to_grant_join, UnableToGrantJoin;
        unknown, Unknown;
    }

    pub fn unknown_token(soft_logout: bool, body: impl Into<ErrorBody>) -> Self {
        Self::new(ErrorKind::UnknownToken { soft_logout }, body)
    }

    pub fn limit_exceeded(retry_after_ms: Option<Duration>, body: impl Into<ErrorBody>) -> Self {
        Self::new(ErrorKind::LimitExceeded { retry_after_ms }, body)
    }

    pub fn incompatible_room_version(
        room_version: RoomVersionId,
        body: impl Into<ErrorBody>,
    ) -> Self {
        Self::new(ErrorKind::IncompatibleRoomVersion { room_version }, body)
    }

    pub fn with_status(mut self, status_code: StatusCode) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// The status this error renders with.
    pub fn effective_status(&self) -> StatusCode {
        self.status_code.unwrap_or_else(|| {
            use ErrorKind::*;
            match &self.kind {
                Forbidden | UnableToAuthorizeJoin | UnableToGrantJoin => StatusCode::FORBIDDEN,
                Unauthorized | UnknownToken { .. } | MissingToken => StatusCode::UNAUTHORIZED,
                NotFound => StatusCode::NOT_FOUND,
                Unrecognized => StatusCode::NOT_FOUND,
                LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            }
        })
    }

    /// The full wire body, `errcode` included.
    pub fn to_body(&self) -> JsonMap<String, JsonValue> {
        let mut body = self.body.0.clone();
        body.insert("errcode".to_owned(), self.kind.as_str().into());
        match &self.kind {
            ErrorKind::UnknownToken { soft_logout } if *soft_logout => {
                body.insert("soft_logout".to_owned(), json!(true));
            }
            ErrorKind::LimitExceeded {
                retry_after_ms: Some(duration),
            } => {
                body.insert(
                    "retry_after_ms".to_owned(),
                    json!(duration.as_millis() as u64),
                );
            }
            ErrorKind::IncompatibleRoomVersion { room_version } => {
                body.insert("room_version".to_owned(), json!(room_version));
            }
            _ => {}
        }
        body
    }

    /// Parses an error response body received from a peer.
    pub fn from_response_body(status_code: StatusCode, body: &str) -> Self {
        let mut map = serde_json::from_str::<JsonMap<String, JsonValue>>(body).unwrap_or_default();
        let kind = match map.remove("errcode").as_ref().and_then(JsonValue::as_str) {
            Some("M_FORBIDDEN") => ErrorKind::Forbidden,
            Some("M_NOT_FOUND") => ErrorKind::NotFound,
            Some("M_BAD_JSON") => ErrorKind::BadJson,
            Some("M_NOT_JSON") => ErrorKind::NotJson,
            Some("M_INVALID_PARAM") => ErrorKind::InvalidParam,
            Some("M_MISSING_PARAM") => ErrorKind::MissingParam,
            Some("M_TOO_LARGE") => ErrorKind::TooLarge,
            Some("M_LIMIT_EXCEEDED") => ErrorKind::LimitExceeded { retry_after_ms: None },
            Some("M_UNSUPPORTED_ROOM_VERSION") => ErrorKind::UnsupportedRoomVersion,
            Some("M_UNAUTHORIZED") => ErrorKind::Unauthorized,
            Some("M_UNRECOGNIZED") => ErrorKind::Unrecognized,
            _ => ErrorKind::Unknown,
        };
        Self {
            status_code: Some(status_code),
            kind,
            body: ErrorBody(map),
        }
    }
}

impl Serialize for MatrixError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_body().serialize(serializer)
    }
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} / {}]", self.effective_status().as_u16(), self.kind)?;
        if let Some(message) = self.body.message() {
            write!(f, " {message}")?;
        }
        Ok(())
    }
}

impl StdError for MatrixError {}

impl Scribe for MatrixError {
    fn render(self, res: &mut salvo::http::Response) {
        res.add_header(header::CONTENT_TYPE, "application/json", true)
            .ok();
        if res.status_code.map(|c| c.is_success()).unwrap_or(true) {
            res.status_code(self.effective_status());
        }
        let bytes = serde_json::to_vec(&self.to_body()).unwrap_or_default();
        res.write_body(bytes).ok();
    }
}

/// The room version string was not one this server understands.
#[derive(Debug)]
pub struct UnknownVersionError;

impl fmt::Display for UnknownVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version string was unknown")
    }
}

impl StdError for UnknownVersionError {}

#[cfg(test)]
mod tests {
    use salvo::http::StatusCode;

    use super::{ErrorKind, MatrixError};

    #[test]
    fn status_mapping() {
        assert_eq!(
            MatrixError::forbidden("no").effective_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            MatrixError::not_found("gone").effective_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MatrixError::too_large("big").effective_status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            MatrixError::limit_exceeded(None, "slow down").effective_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            MatrixError::invalid_param("bad").effective_status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn body_carries_errcode_and_extras() {
        let body = MatrixError::unknown_token(true, "expired").to_body();
        assert_eq!(body["errcode"], "M_UNKNOWN_TOKEN");
        assert_eq!(body["error"], "expired");
        assert_eq!(body["soft_logout"], true);

        let body =
            MatrixError::limit_exceeded(Some(std::time::Duration::from_millis(200)), "whoa")
                .to_body();
        assert_eq!(body["errcode"], "M_LIMIT_EXCEEDED");
        assert_eq!(body["retry_after_ms"], 200);
    }

    #[test]
    fn parses_peer_errors() {
        let err = MatrixError::from_response_body(
            StatusCode::FORBIDDEN,
            r#"{"errcode":"M_FORBIDDEN","error":"denied"}"#,
        );
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert_eq!(err.body.message(), Some("denied"));
    }
}
