//! Single-provider chat, blocking and streaming.
//!
//! Both variants ensure the conversation row, append the incoming user turn,
//! resolve the credential, then invoke. The streaming variant finishes the
//! handshake before the response starts, so a missing key is still a plain
//! JSON error and never a broken event stream.

use crate::error::ApiError;
use crate::routes::{MAX_MESSAGE_CHARS, MAX_MESSAGES, MAX_MODEL_CHARS, user_id};
use crate::server::AppState;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Extension, Json};
use futures_util::{Stream, StreamExt};
use ls_llm::{InvocationRequest, Message, Provider, Role};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/chat", post(send_chat_message))
        .route("/api/v1/chat/stream", post(stream_chat_message))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    provider: Provider,
    model: String,
    messages: Vec<Message>,
    #[serde(default, rename = "conversationId")]
    conversation_id: Option<String>,
}

fn validate(req: &ChatRequest) -> Result<(), ApiError> {
    if req.model.is_empty() || req.model.len() > MAX_MODEL_CHARS {
        return Err(ApiError::Validation(format!(
            "model must be between 1 and {MAX_MODEL_CHARS} characters"
        )));
    }
    if req.messages.is_empty() || req.messages.len() > MAX_MESSAGES {
        return Err(ApiError::Validation(format!(
            "messages must contain between 1 and {MAX_MESSAGES} entries"
        )));
    }
    for message in &req.messages {
        if message.content.is_empty() || message.content.len() > MAX_MESSAGE_CHARS {
            return Err(ApiError::Validation(format!(
                "message content must be between 1 and {MAX_MESSAGE_CHARS} characters"
            )));
        }
    }
    Ok(())
}

/// Shared preamble for both chat variants: conversation row, user turn
/// persisted, credential resolved, request built.
async fn prepare_invocation(
    state: &AppState,
    user: &str,
    req: &ChatRequest,
) -> Result<(String, InvocationRequest), ApiError> {
    validate(req)?;
    let conversation = state
        .store
        .ensure_conversation(user, req.provider, &req.model, req.conversation_id.clone())
        .await?;

    if let Some(latest) = req.messages.last() {
        if latest.role == Role::User {
            state
                .store
                .append_message(&conversation.id, Role::User, &latest.content)
                .await?;
        }
    }

    let api_key = state
        .resolver_for(user)
        .resolve(req.provider)
        .await
        .map_err(|e| ApiError::BadRequest(e.public_message()))?;
    let request = InvocationRequest::new(
        req.provider,
        req.model.clone(),
        req.messages.clone(),
        api_key,
        state.config.llm.max_tokens,
    );
    Ok((conversation.id, request))
}

#[tracing::instrument(level = "info", skip_all)]
async fn send_chat_message(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers);
    let (conversation_id, request) = prepare_invocation(&state, &user, &req).await?;

    let response_text = state.invoker.invoke(&request).await.map_err(ApiError::from)?;
    state
        .store
        .append_message(&conversation_id, Role::Assistant, &response_text)
        .await?;

    Ok(Json(serde_json::json!({
        "response": response_text,
        "conversationId": conversation_id,
    })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn stream_chat_message(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user = user_id(&headers);
    let (conversation_id, request) = prepare_invocation(&state, &user, &req).await?;

    let (tx, rx) = mpsc::channel::<Event>(32);
    tokio::spawn(run_chat_stream(state, request, conversation_id, tx));

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default()))
}

async fn run_chat_stream(
    state: Arc<AppState>,
    request: InvocationRequest,
    conversation_id: String,
    tx: mpsc::Sender<Event>,
) {
    let mut stream = match state.invoker.invoke_stream(&request).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "chat stream handshake failed");
            let _ = tx.send(error_frame(&e.public_message())).await;
            return;
        }
    };

    let mut full_text = String::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(delta) => {
                full_text.push_str(&delta);
                let frame = data_frame(serde_json::json!({
                    "content": delta,
                    "conversationId": conversation_id,
                }));
                if tx.send(frame).await.is_err() {
                    // Client went away; drop the partial turn unpersisted.
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "chat stream failed mid-flight");
                let _ = tx.send(error_frame(&e.public_message())).await;
                return;
            }
        }
    }

    if let Err(e) = state
        .store
        .append_message(&conversation_id, Role::Assistant, &full_text)
        .await
    {
        tracing::error!(error = %e, "failed to persist streamed assistant turn");
        let _ = tx
            .send(error_frame("Unable to persist the assistant response."))
            .await;
        return;
    }
    let _ = tx
        .send(data_frame(serde_json::json!({
            "done": true,
            "conversationId": conversation_id,
        })))
        .await;
}

fn data_frame(value: serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

fn error_frame(message: &str) -> Event {
    data_frame(serde_json::json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::server::AppState;
    use crate::store::Store;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use ls_llm::{Invoker, TextStream};

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            provider: Provider::OpenAi,
            model: "gpt-4o".to_string(),
            messages,
            conversation_id: None,
        }
    }

    #[test]
    fn accepts_a_plain_user_turn() {
        let req = request(vec![Message::new(Role::User, "hello")]);
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn rejects_empty_message_list() {
        let req = request(vec![]);
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }

    #[test]
    fn rejects_oversized_message_content() {
        let req = request(vec![Message::new(Role::User, "x".repeat(MAX_MESSAGE_CHARS + 1))]);
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }

    #[test]
    fn rejects_too_many_messages() {
        let messages = (0..=MAX_MESSAGES)
            .map(|i| Message::new(Role::User, format!("turn {i}")))
            .collect();
        let req = request(messages);
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }

    #[test]
    fn rejects_blank_model() {
        let mut req = request(vec![Message::new(Role::User, "hello")]);
        req.model = String::new();
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }

    /// Stand-in for the HTTP client in paths that must fail before any
    /// provider call happens.
    struct NeverInvoked;

    #[async_trait]
    impl Invoker for NeverInvoked {
        async fn invoke(&self, _request: &InvocationRequest) -> ls_llm::Result<String> {
            panic!("invocation must not be reached without a credential");
        }

        async fn invoke_stream(&self, _request: &InvocationRequest) -> ls_llm::Result<TextStream> {
            panic!("invocation must not be reached without a credential");
        }
    }

    #[tokio::test]
    async fn missing_credential_is_a_bad_request_before_invocation() {
        let state = AppState::new(
            AppConfig::default(),
            Store::open_in_memory().expect("open"),
            Arc::new(NeverInvoked),
        );
        let mut req = request(vec![Message::new(Role::User, "hello")]);
        req.provider = Provider::Mistral;
        req.model = "mistral-large-latest".to_string();

        let err = prepare_invocation(&state, "alice", &req)
            .await
            .expect_err("no key stored and no fallback configured");
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn error_frame_is_a_json_error_payload() {
        let frame = error_frame("Provider request failed.");
        let rendered = format!("{frame:?}");
        assert!(rendered.contains("Provider request failed."));
    }
}
