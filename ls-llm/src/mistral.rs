use crate::client::{TextStream, provider_error, read_success_body, send_with_retry};
use crate::error::Result;
use crate::openai::{decode_chat_completion, delta_stream, wire_messages};
use crate::sse::decode_sse_data;
use crate::types::InvocationRequest;
use serde::Serialize;

const MISTRAL_CHAT_COMPLETIONS_URL: &str = "https://api.mistral.ai/v1/chat/completions";
const PROVIDER: &str = "Mistral";

/// Mistral speaks the OpenAI chat-completions dialect (legacy `max_tokens`
/// field, `[DONE]`-terminated SSE) behind its own endpoint and bearer key.
pub(crate) struct MistralAdapter {
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct MistralChatRequest {
    model: String,
    messages: Vec<crate::openai::WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl MistralChatRequest {
    fn new(request: &InvocationRequest, stream: bool) -> Self {
        Self {
            model: request.model.clone(),
            messages: wire_messages(&request.messages),
            max_tokens: request.max_tokens,
            stream: if stream { Some(true) } else { None },
        }
    }
}

impl MistralAdapter {
    pub(crate) fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub(crate) async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        let body = MistralChatRequest::new(request, false);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(MISTRAL_CHAT_COMPLETIONS_URL)
                .bearer_auth(&request.api_key)
                .json(&body)
        })
        .await?;
        let text = read_success_body(PROVIDER, response).await?;
        decode_chat_completion(PROVIDER, &text)
    }

    pub(crate) async fn invoke_stream(&self, request: &InvocationRequest) -> Result<TextStream> {
        let body = MistralChatRequest::new(request, true);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(MISTRAL_CHAT_COMPLETIONS_URL)
                .bearer_auth(&request.api_key)
                .json(&body)
        })
        .await?;
        if !response.status().is_success() {
            return Err(provider_error(PROVIDER, response).await);
        }
        let sse = decode_sse_data(response.bytes_stream());
        Ok(delta_stream(PROVIDER, sse))
    }
}
