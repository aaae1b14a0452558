//! Multi-provider fan-out, blocking and streaming.
//!
//! The streaming variant bridges the coordinator's event channel onto SSE
//! frames and persists the comparison record after the terminal marker,
//! built from completed branches only.

use crate::error::ApiError;
use crate::routes::{MAX_COMPARE_BRANCHES, MAX_MODEL_CHARS, MAX_PROMPT_CHARS, user_id};
use crate::server::AppState;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Extension, Json};
use futures_util::{Stream, StreamExt};
use ls_llm::{CompareEvent, InvocationResult, ProviderModel};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/compare", post(compare))
        .route("/api/v1/compare/stream", post(compare_stream))
}

#[derive(Debug, Deserialize)]
struct CompareRequest {
    prompt: String,
    providers: Vec<ProviderModel>,
}

fn validate(req: &CompareRequest) -> Result<(), ApiError> {
    if req.prompt.is_empty() || req.prompt.len() > MAX_PROMPT_CHARS {
        return Err(ApiError::Validation(format!(
            "prompt must be between 1 and {MAX_PROMPT_CHARS} characters"
        )));
    }
    if req.providers.is_empty() || req.providers.len() > MAX_COMPARE_BRANCHES {
        return Err(ApiError::Validation(format!(
            "providers must contain between 1 and {MAX_COMPARE_BRANCHES} entries"
        )));
    }
    for entry in &req.providers {
        if entry.model.is_empty() || entry.model.len() > MAX_MODEL_CHARS {
            return Err(ApiError::Validation(format!(
                "model must be between 1 and {MAX_MODEL_CHARS} characters"
            )));
        }
    }
    Ok(())
}

#[tracing::instrument(level = "info", skip_all)]
async fn compare(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompareRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate(&req)?;
    let user = user_id(&headers);
    let resolver = state.resolver_for(&user);

    let results = state
        .coordinator
        .compare(&req.prompt, &req.providers, resolver, state.config.llm.max_tokens)
        .await
        .map_err(ApiError::from)?;

    let comparison = state
        .store
        .save_comparison(&user, &req.prompt, results)
        .await?;

    Ok(Json(serde_json::json!({
        "id": comparison.id,
        "prompt": comparison.prompt,
        "results": comparison.results,
    })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn compare_stream(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompareRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    validate(&req)?;
    let user = user_id(&headers);
    let resolver = state.resolver_for(&user);

    let events = state
        .coordinator
        .compare_stream(&req.prompt, &req.providers, resolver, state.config.llm.max_tokens)
        .map_err(ApiError::from)?;

    let (tx, rx) = mpsc::channel::<Event>(32);
    tokio::spawn(bridge_compare_events(state, user, req.prompt, events, tx));

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default()))
}

/// Relay coordinator events as SSE frames, collecting completed branch
/// results along the way. The record is saved once `Done` arrives; branches
/// that only errored are left out rather than stored as empty responses.
async fn bridge_compare_events(
    state: Arc<AppState>,
    user: String,
    prompt: String,
    mut events: mpsc::Receiver<CompareEvent>,
    tx: mpsc::Sender<Event>,
) {
    let mut completed: Vec<InvocationResult> = Vec::new();

    while let Some(event) = events.recv().await {
        let frame = match event {
            CompareEvent::Start { total } => serde_json::json!({
                "event": "start",
                "total": total,
            }),
            CompareEvent::Chunk {
                provider,
                model,
                text,
            } => serde_json::json!({
                "event": "chunk",
                "provider": provider,
                "model": model,
                "chunk": text,
            }),
            CompareEvent::Complete { result } => {
                let frame = serde_json::json!({
                    "event": "complete",
                    "provider": result.provider,
                    "model": result.model,
                    "data": result,
                });
                completed.push(result);
                frame
            }
            CompareEvent::BranchError {
                provider,
                model,
                message,
            } => serde_json::json!({
                "event": "error",
                "provider": provider,
                "model": model,
                "error": message,
            }),
            CompareEvent::Done => break,
        };
        if tx.send(data_frame(frame)).await.is_err() {
            // Client disconnected; dropping the receiver cancels the
            // remaining branches. Nothing gets persisted.
            return;
        }
    }

    let comparison_id = if completed.is_empty() {
        None
    } else {
        match state.store.save_comparison(&user, &prompt, completed).await {
            Ok(comparison) => Some(comparison.id),
            Err(e) => {
                tracing::error!(error = %e, "failed to persist streamed comparison");
                None
            }
        }
    };
    let _ = tx
        .send(data_frame(serde_json::json!({
            "event": "done",
            "comparisonId": comparison_id,
        })))
        .await;
}

fn data_frame(value: serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ls_llm::Provider;

    fn pair(model: &str) -> ProviderModel {
        ProviderModel {
            provider: Provider::OpenAi,
            model: model.to_string(),
        }
    }

    fn request(prompt: &str, providers: Vec<ProviderModel>) -> CompareRequest {
        CompareRequest {
            prompt: prompt.to_string(),
            providers,
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        let req = request("Explain ownership", vec![pair("gpt-4o")]);
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn rejects_empty_prompt() {
        let req = request("", vec![pair("gpt-4o")]);
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }

    #[test]
    fn rejects_oversized_prompt() {
        let req = request(&"x".repeat(MAX_PROMPT_CHARS + 1), vec![pair("gpt-4o")]);
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }

    #[test]
    fn rejects_empty_provider_list() {
        let req = request("prompt", vec![]);
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }

    #[test]
    fn rejects_more_than_four_branches() {
        let providers = (0..5).map(|i| pair(&format!("model-{i}"))).collect();
        let req = request("prompt", providers);
        assert!(matches!(validate(&req), Err(ApiError::Validation(_))));
    }
}
