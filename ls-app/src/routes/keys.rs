//! Per-user provider key storage. GET never returns key material, only which
//! providers have a key.

use crate::error::ApiError;
use crate::routes::user_id;
use crate::server::AppState;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Extension, Json};
use ls_llm::Provider;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/keys", get(get_keys).put(put_keys))
}

#[derive(Debug, Default, Deserialize)]
struct KeysRequest {
    #[serde(default)]
    openai: String,
    #[serde(default)]
    anthropic: String,
    #[serde(default)]
    gemini: String,
    #[serde(default)]
    mistral: String,
}

#[tracing::instrument(level = "info", skip_all)]
async fn put_keys(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<KeysRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let entries = vec![
        (Provider::OpenAi, req.openai),
        (Provider::Anthropic, req.anthropic),
        (Provider::Gemini, req.gemini),
        (Provider::Mistral, req.mistral),
    ];
    state.store.set_api_keys(&user, entries).await?;
    Ok(Json(serde_json::json!({ "message": "API keys updated" })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_keys(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let stored = state.store.configured_providers(&user).await?;
    let fallback = state.config.fallback_keys();

    let mut providers = serde_json::Map::new();
    for provider in [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Mistral,
    ] {
        let configured = stored.contains(&provider) || fallback.contains_key(&provider);
        providers.insert(provider.to_string(), serde_json::Value::Bool(configured));
    }
    Ok(Json(serde_json::json!({ "providers": providers })))
}
