use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use modelgate_protocol::error::ErrorKind;

use crate::error::ProxyError;
use crate::state::AppState;

/// Bearer-key gate for the `/v1` surface. With no keys configured the proxy is
/// open, matching the file-config contract.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let runtime = state.runtime();
    if !runtime.auth_enabled() {
        return next.run(req).await;
    }

    let Some(header) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return ProxyError::unauthorized(
            ErrorKind::InvalidRequestError,
            "Missing Authorization header",
        )
        .into_response();
    };

    let mut parts = header.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().map(str::trim).unwrap_or_default();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return ProxyError::unauthorized(
            ErrorKind::InvalidRequestError,
            "Invalid Authorization header format. Expected: Bearer <api_key>",
        )
        .into_response();
    }

    if !runtime.accepts_key(token) {
        return ProxyError::unauthorized(ErrorKind::InvalidApiKey, "Invalid API key")
            .into_response();
    }

    next.run(req).await
}
