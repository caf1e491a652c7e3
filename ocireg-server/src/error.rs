//! Maps the narrower subsystem errors (store, mapping, upload, resolver,
//! remote) onto the HTTP-visible shape from §7: a status code plus a
//! `{"error": "..."}` JSON body. Mirrors the `Error -> StatusCode` /
//! `Error -> Response` conversions used for the narrower HTTP surfaces
//! elsewhere in this codebase, just collapsed into one registry-wide enum
//! instead of one per handler module.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {message}")]
    BadRequest { message: String },
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } | Self::DigestMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };
        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, Self::Unauthorized) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Basic realm="ocireg""#),
            );
        }
        response
    }
}

impl From<ocireg_store::blobstore::Error> for ApiError {
    fn from(e: ocireg_store::blobstore::Error) -> Self {
        log::error!("blob store error: {e}");
        Self::bad_request(e.to_string())
    }
}

impl From<ocireg_store::mapping::Error> for ApiError {
    fn from(e: ocireg_store::mapping::Error) -> Self {
        log::error!("mapping index error: {e}");
        Self::bad_request(e.to_string())
    }
}

impl From<ocireg_store::upload::Error> for ApiError {
    fn from(e: ocireg_store::upload::Error) -> Self {
        use ocireg_store::upload::Error as E;
        match e {
            E::NoSession(_) => Self::NotFound,
            E::DigestMismatch { expected, actual } => Self::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            },
            E::Store(e) => e.into(),
        }
    }
}

impl From<ocireg_remote::resolver::Error> for ApiError {
    fn from(e: ocireg_remote::resolver::Error) -> Self {
        use ocireg_remote::resolver::Error as E;
        match e {
            E::NotFound => Self::NotFound,
            E::Store(e) => e.into(),
        }
    }
}

impl From<ocireg_core::manifest::Error> for ApiError {
    fn from(e: ocireg_core::manifest::Error) -> Self {
        Self::bad_request(e.to_string())
    }
}
