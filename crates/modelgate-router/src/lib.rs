mod admin;
mod openai;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Router, middleware};

use modelgate_core::auth::require_api_key;
use modelgate_core::state::AppState;

/// The OpenAI-compatible surface plus the stats probe. Key auth guards `/v1`
/// only; `/internal/stats` is meant for monitors on a trusted network.
pub fn proxy_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/chat/completions", post(openai::chat_completions))
        .route("/models", get(openai::list_models))
        .route("/models/{model}", get(openai::get_model))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .nest("/v1", v1)
        .route("/internal/stats", get(openai::stats))
        .with_state(state)
}

/// Key-authenticated admin surface; nest under `/api/admin`.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/login", post(admin::login))
        .route("/health", get(admin::health))
        .route("/config", get(admin::get_config).post(admin::save_config))
        .with_state(state)
}
