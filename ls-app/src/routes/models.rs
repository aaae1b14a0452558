use crate::error::ApiError;
use crate::registry;
use axum::extract::Query;
use axum::routing::get;
use axum::Json;
use ls_llm::Provider;
use serde::Deserialize;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/models", get(list_models))
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    provider: Option<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_models(
    Query(query): Query<ModelsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provider = match query.provider.as_deref() {
        Some(raw) => Some(
            raw.parse::<Provider>()
                .map_err(ApiError::BadRequest)?,
        ),
        None => None,
    };
    let models = registry::models_for(provider);
    Ok(Json(serde_json::json!({ "models": models })))
}
