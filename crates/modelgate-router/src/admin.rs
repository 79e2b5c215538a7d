use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use modelgate_common::{ProxyConfig, ProxyConfigPatch};
use modelgate_core::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    #[serde(default)]
    api_key: String,
}

pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    let admin_key = state.runtime().admin_key.clone();
    if !admin_key.is_empty() && request.api_key == admin_key {
        Json(json!({ "success": true })).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "invalid admin key" })),
        )
            .into_response()
    }
}

pub(crate) async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    Json(json!({ "providers": state.manager().stats() })).into_response()
}

pub(crate) async fn get_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match ProxyConfig::load(state.config_path()) {
        Ok(config) => Json(config).into_response(),
        Err(err) => admin_error(err.to_string()),
    }
}

/// Persists the merged configuration, then hot-reloads the Manager: the
/// round-robin counter carries over and the old recovery loop is stopped.
pub(crate) async fn save_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<ProxyConfigPatch>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let path = state.config_path().to_path_buf();
    let mut config = match ProxyConfig::load(&path) {
        Ok(config) => config,
        Err(err) => return admin_error(err.to_string()),
    };
    config.apply(patch);
    if let Err(err) = config.save(&path) {
        return admin_error(err.to_string());
    }
    if let Err(err) = state.reload(&config) {
        return admin_error(err.to_string());
    }

    info!(path = %path.display(), "configuration saved and reloaded");
    Json(json!({ "success": true })).into_response()
}

/// Admin calls authenticate with the configured admin key in `X-API-Key`. An
/// empty configured key disables the surface entirely.
fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let admin_key = state.runtime().admin_key.clone();
    if admin_key.is_empty() {
        return false;
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        == Some(admin_key.as_str())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "message": "unauthorized" })),
    )
        .into_response()
}

fn admin_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "message": message })),
    )
        .into_response()
}
