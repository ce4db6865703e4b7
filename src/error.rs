//! Shared error taxonomy and the single HTTP-boundary JSON writer.
//!
//! Subsystem modules define their own small `thiserror` enums (see
//! [`crate::http_client::HttpClientError`], [`crate::signature::SignatureError`], ...)
//! and convert into [`AppError`] only at the point a request handler needs to return
//! one. The orchestrator (`crate::peers::Orchestrator`) never produces an `AppError`
//! directly — its errors are classified into a [`crate::peers::ReasonCode`] instead,
//! per spec §7's propagation rule.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The closed set of error kinds rendered at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    ValidationFailed,
    InvalidJson,
    InvalidCredentials,
    Unauthenticated,
    SessionExpired,
    ForbiddenPolicy,
    PeerMismatch,
    NotFound,
    Conflict,
    RateLimited,
    UpstreamUnreachable,
    SignatureRequired,
    SignatureInvalid,
    DigestMismatch,
    SsrfBlocked,
    RedirectViolation,
    ResponseTooLarge,
    TokenExchangeFailed,
    NotImplemented,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        use ErrorKind::*;
        match self {
            BadRequest | InvalidJson | ValidationFailed => StatusCode::BAD_REQUEST,
            InvalidCredentials | Unauthenticated | SessionExpired | SignatureRequired => {
                StatusCode::UNAUTHORIZED
            }
            ForbiddenPolicy | PeerMismatch | SsrfBlocked => StatusCode::FORBIDDEN,
            NotFound => StatusCode::NOT_FOUND,
            Conflict => StatusCode::CONFLICT,
            RateLimited => StatusCode::TOO_MANY_REQUESTS,
            UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            SignatureInvalid | DigestMismatch => StatusCode::UNAUTHORIZED,
            RedirectViolation | ResponseTooLarge => StatusCode::BAD_GATEWAY,
            TokenExchangeFailed => StatusCode::BAD_REQUEST,
            NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The error returned at the HTTP boundary: a kind plus a human-readable message.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self { kind, message: message.into(), source: Some(source.into()) }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorKind,
    description: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.kind == ErrorKind::Internal {
            tracing::error!(error = %self.message, source = ?self.source, "internal error");
        }
        let status = self.kind.status();
        let body = ErrorBody { error: self.kind, description: &self.message };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_status_mapping_is_stable() {
        assert_eq!(ErrorKind::SignatureRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::SsrfBlocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::NotImplemented.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn serializes_as_error_description_json() {
        let e = AppError::new(ErrorKind::SignatureRequired, "signature required");
        let v = serde_json::to_value(ErrorBody { error: e.kind, description: &e.message }).unwrap();
        assert_eq!(v["error"], "signature_required");
        assert_eq!(v["description"], "signature required");
    }
}
