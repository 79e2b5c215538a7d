use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use modelgate_core::dispatch;
use modelgate_core::error::ProxyError;
use modelgate_core::state::AppState;
use modelgate_protocol::openai::{ModelInfo, ModelList, now_epoch_seconds};

pub(crate) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch::chat_completions(state, headers, body).await
}

pub(crate) async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let created = now_epoch_seconds();
    let data = state
        .manager()
        .aliases()
        .into_iter()
        .map(|alias| ModelInfo::new(alias, created))
        .collect();
    Json(ModelList::new(data))
}

pub(crate) async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Response {
    if state.manager().has_alias(&model) {
        Json(ModelInfo::new(model, now_epoch_seconds())).into_response()
    } else {
        ProxyError::not_found(format!("model {model} not found")).into_response()
    }
}

pub(crate) async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "providers": state.manager().stats() }))
}
