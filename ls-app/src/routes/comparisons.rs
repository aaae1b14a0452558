use crate::error::ApiError;
use crate::routes::user_id;
use crate::server::AppState;
use axum::extract::{Path, Query};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 100;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/comparisons", get(list_comparisons))
        .route("/api/v1/comparisons/{id}/vote", post(vote_on_comparison))
        .route(
            "/api/v1/comparisons/{id}",
            axum::routing::delete(delete_comparison),
        )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_comparisons(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let comparisons = state.store.list_comparisons(&user, limit, offset).await?;
    Ok(Json(serde_json::json!({
        "comparisons": comparisons,
        "limit": limit,
        "offset": offset,
    })))
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    preferred_index: usize,
}

#[tracing::instrument(level = "info", skip_all, fields(comparison_id = %id))]
async fn vote_on_comparison(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let comparison = state.store.set_vote(&id, &user, req.preferred_index).await?;
    Ok(Json(serde_json::to_value(comparison).map_err(|e| {
        ApiError::Internal(format!("comparison serialization failed: {e}"))
    })?))
}

#[tracing::instrument(level = "info", skip_all, fields(comparison_id = %id))]
async fn delete_comparison(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    state.store.delete_comparison(&id, &user).await?;
    Ok(Json(serde_json::json!({ "message": "Comparison deleted successfully" })))
}
