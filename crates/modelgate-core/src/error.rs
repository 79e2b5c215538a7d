use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use modelgate_protocol::error::{ErrorEnvelope, ErrorKind};

/// A proxy-originated failure, ready to render as an OpenAI-shaped response.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub envelope: ErrorEnvelope,
}

impl ProxyError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope::new(kind, message),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::InvalidRequestError, message)
    }

    pub fn unauthorized(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, kind, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFoundError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ServiceUnavailable,
            message,
        )
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, ErrorKind::UpstreamError, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ServerError,
            message,
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}
