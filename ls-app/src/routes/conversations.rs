use crate::error::ApiError;
use crate::routes::user_id;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/conversations", get(list_conversations))
        .route(
            "/api/v1/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_conversations(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let conversations = state.store.list_conversations(&user).await?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

#[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %id))]
async fn get_conversation(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let (conversation, messages) = state.store.get_conversation(&id, &user).await?;
    let message_count = messages.len();
    Ok(Json(serde_json::json!({
        "id": conversation.id,
        "provider": conversation.provider,
        "model": conversation.model,
        "createdAt": conversation.created_at,
        "lastMessageAt": conversation.last_message_at,
        "messages": messages,
        "messageCount": message_count,
    })))
}

#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
async fn delete_conversation(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    state.store.delete_conversation(&id, &user).await?;
    Ok(Json(serde_json::json!({ "message": "Conversation deleted successfully" })))
}
