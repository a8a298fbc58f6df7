use std::io;

use async_trait::async_trait;
use salvo::prelude::{Depot, Request, Response, Writer};
use salvo::writing::Scribe;
use thiserror::Error;

use crate::MatrixError;
use crate::core::identifiers::IdParseError;
use crate::core::sending::SendError;
use crate::core::serde::CanonicalJsonError;
use crate::core::signatures;
use crate::core::state::StateError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("public: `{0}`")]
    Public(String),
    #[error("internal: `{0}`")]
    Internal(String),
    #[error("salvo internal error: `{0}`")]
    Salvo(#[from] salvo::Error),
    #[error("http parse: `{0}`")]
    HttpParse(#[from] salvo::http::ParseError),
    #[error("io: `{0}`")]
    Io(#[from] io::Error),
    #[error("url parse: `{0}`")]
    UrlParse(#[from] url::ParseError),
    #[error("serde json: `{0}`")]
    SerdeJson(#[from] serde_json::Error),
    #[error("reqwest: `{0}`")]
    Reqwest(#[from] reqwest::Error),
    #[error("matrix error: `{0}`")]
    Matrix(#[from] MatrixError),
    #[error("send error: `{0}`")]
    Send(#[from] SendError),
    #[error("id parse error: `{0}`")]
    IdParse(#[from] IdParseError),
    #[error("canonical json error: `{0}`")]
    CanonicalJson(#[from] CanonicalJsonError),
    #[error("signatures error: `{0}`")]
    Signatures(#[from] signatures::Error),
    #[error("state error: `{0}`")]
    State(#[from] StateError),
}

impl AppError {
    pub fn public<S: Into<String>>(msg: S) -> Self {
        Self::Public(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// The Matrix error this failure renders as.
    pub fn to_matrix(&self) -> MatrixError {
        match self {
            Self::Public(msg) => MatrixError::unknown(msg.clone()),
            Self::Matrix(e) => e.clone(),
            Self::IdParse(e) => MatrixError::invalid_param(e.to_string()),
            Self::CanonicalJson(e) => MatrixError::bad_json(e.to_string()),
            Self::SerdeJson(e) => MatrixError::bad_json(e.to_string()),
            Self::HttpParse(e) => MatrixError::not_json(e.to_string()),
            Self::State(StateError::AuthFailed(reason)) => {
                MatrixError::forbidden(reason.clone())
            }
            Self::State(StateError::NotFound(what)) => MatrixError::not_found(what.clone()),
            Self::State(e) => MatrixError::invalid_param(e.to_string()),
            Self::Signatures(e) => MatrixError::unauthorized(e.to_string()),
            Self::Internal(_) => MatrixError::unknown("internal error"),
            _ => MatrixError::unknown("unknown error happened"),
        }
    }
}

#[async_trait]
impl Writer for AppError {
    async fn write(mut self, _req: &mut Request, _depot: &mut Depot, res: &mut Response) {
        match &self {
            AppError::Matrix(_) | AppError::Public(_) => {
                debug!(error = ?self, "request failed")
            }
            _ => error!(error = ?self, "request failed"),
        }
        self.to_matrix().render(res);
    }
}

#[cfg(test)]
mod tests {
    use salvo::http::StatusCode;

    use super::AppError;
    use crate::MatrixError;
    use crate::core::ErrorKind;

    #[test]
    fn matrix_errors_pass_through() {
        let err = AppError::from(MatrixError::forbidden("nope"));
        let matrix = err.to_matrix();
        assert_eq!(matrix.kind, ErrorKind::Forbidden);
        assert_eq!(matrix.effective_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = AppError::internal("db exploded at /var/lib/secret");
        let matrix = err.to_matrix();
        assert_eq!(matrix.kind, ErrorKind::Unknown);
        assert_eq!(matrix.body.message(), Some("internal error"));
    }
}
