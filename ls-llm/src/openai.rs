use crate::client::{TextStream, provider_error, read_success_body, send_with_retry};
use crate::error::{LlmError, Result};
use crate::sse::{SseEvent, decode_sse_data};
use crate::types::{InvocationRequest, Message};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const PROVIDER: &str = "OpenAI";

pub(crate) struct OpenAiAdapter {
    http: reqwest::Client,
}

impl OpenAiAdapter {
    pub(crate) fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub(crate) async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        let body = OpenAiChatRequest::new(&request.model, &request.messages, request.max_tokens, false);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(OPENAI_CHAT_COMPLETIONS_URL)
                .bearer_auth(&request.api_key)
                .json(&body)
        })
        .await?;
        let text = read_success_body(PROVIDER, response).await?;
        decode_chat_completion(PROVIDER, &text)
    }

    pub(crate) async fn invoke_stream(&self, request: &InvocationRequest) -> Result<TextStream> {
        let body = OpenAiChatRequest::new(&request.model, &request.messages, request.max_tokens, true);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(OPENAI_CHAT_COMPLETIONS_URL)
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

/// Newer reasoning-model families reject `max_tokens` and require
/// `max_completion_tokens` instead.
fn uses_completion_token_field(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    ["gpt-5", "o3", "o4"].iter().any(|prefix| m.starts_with(prefix))
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl OpenAiChatRequest {
    pub(crate) fn new(model: &str, messages: &[Message], max_tokens: u32, stream: bool) -> Self {
        let (legacy, completion) = if uses_completion_token_field(model) {
            (None, Some(max_tokens))
        } else {
            (Some(max_tokens), None)
        };
        Self {
            model: model.to_string(),
            messages: wire_messages(messages),
            max_tokens: legacy,
            max_completion_tokens: completion,
            stream: if stream { Some(true) } else { None },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct WireMessage {
    role: String,
    content: String,
}

pub(crate) fn wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull `choices[0].message.content` out of an OpenAI-compatible response
/// body. Shared by the OpenAI, Mistral and gateway adapters.
pub(crate) fn decode_chat_completion(provider: &'static str, body: &str) -> Result<String> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| LlmError::Decode {
            provider,
            detail: e.to_string(),
        })?;
    let choice = parsed.choices.into_iter().next().ok_or(LlmError::Decode {
        provider,
        detail: "response missing choices".to_string(),
    })?;
    choice.message.content.ok_or(LlmError::Decode {
        provider,
        detail: "choice missing message content".to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Turn a decoded `data:` event stream into text deltas. Frames with no
/// content delta (role-only, keep-alive, usage) are skipped; the `[DONE]`
/// sentinel or connection close ends the stream. Shared by the
/// OpenAI-compatible adapters.
pub(crate) fn delta_stream<S>(provider: &'static str, sse: S) -> TextStream
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    let sse = Box::pin(sse);
    let stream = futures_util::stream::unfold(sse, move |mut sse| async move {
        loop {
            let next = sse.as_mut().next().await?;
            match next {
                Ok(SseEvent::Data(data)) => {
                    if data.trim() == "[DONE]" {
                        return None;
                    }
                    let chunk: StreamChunk = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            return Some((
                                Err(LlmError::Decode {
                                    provider,
                                    detail: format!("stream chunk: {e}"),
                                }),
                                sse,
                            ));
                        }
                    };
                    let Some(choice) = chunk.choices.into_iter().next() else {
                        continue;
                    };
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            return Some((Ok(content), sse));
                        }
                    }
                }
                Ok(SseEvent::Other) => continue,
                Err(e) => return Some((Err(e), sse)),
            }
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn messages() -> Vec<Message> {
        vec![Message::new(Role::User, "hello")]
    }

    #[test]
    fn legacy_models_use_max_tokens() {
        let req = OpenAiChatRequest::new("gpt-4", &messages(), 1000, false);
        let encoded = serde_json::to_value(&req).expect("serialize");
        assert_eq!(encoded["max_tokens"], 1000);
        assert!(encoded.get("max_completion_tokens").is_none());
        assert!(encoded.get("stream").is_none());
    }

    #[test]
    fn reasoning_models_use_max_completion_tokens() {
        for model in ["gpt-5-mini", "o3", "o3-mini", "o4-mini", "gpt-5"] {
            let req = OpenAiChatRequest::new(model, &messages(), 1000, false);
            let encoded = serde_json::to_value(&req).expect("serialize");
            assert_eq!(encoded["max_completion_tokens"], 1000, "model {model}");
            assert!(encoded.get("max_tokens").is_none(), "model {model}");
        }
    }

    #[test]
    fn stream_flag_is_set_only_when_streaming() {
        let req = OpenAiChatRequest::new("gpt-4o", &messages(), 500, true);
        let encoded = serde_json::to_value(&req).expect("serialize");
        assert_eq!(encoded["stream"], true);
    }

    #[test]
    fn decode_extracts_first_choice_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi there"}}]}"#;
        assert_eq!(decode_chat_completion(PROVIDER, body).expect("decode"), "hi there");
    }

    #[test]
    fn decode_fails_on_missing_choices() {
        let err = decode_chat_completion(PROVIDER, r#"{"choices":[]}"#).expect_err("must fail");
        assert!(matches!(err, LlmError::Decode { .. }));
    }

    #[test]
    fn decode_fails_on_null_content() {
        let body = r#"{"choices":[{"message":{"content":null}}]}"#;
        let err = decode_chat_completion(PROVIDER, body).expect_err("must fail");
        assert!(matches!(err, LlmError::Decode { .. }));
    }

    #[tokio::test]
    async fn delta_stream_yields_only_content_deltas_until_done() {
        let frames = vec![
            Ok(SseEvent::Data(
                r#"{"choices":[{"delta":{"role":"assistant"}}]}"#.to_string(),
            )),
            Ok(SseEvent::Data(
                r#"{"choices":[{"delta":{"content":"Hello"}}]}"#.to_string(),
            )),
            Ok(SseEvent::Other),
            Ok(SseEvent::Data(
                r#"{"choices":[{"delta":{"content":" world"}}]}"#.to_string(),
            )),
            Ok(SseEvent::Data("[DONE]".to_string())),
            Ok(SseEvent::Data(
                r#"{"choices":[{"delta":{"content":"never"}}]}"#.to_string(),
            )),
        ];
        let mut stream = delta_stream(PROVIDER, futures_util::stream::iter(frames));

        assert_eq!(stream.next().await.expect("delta").expect("ok"), "Hello");
        assert_eq!(stream.next().await.expect("delta").expect("ok"), " world");
        assert!(stream.next().await.is_none(), "nothing after [DONE]");
    }

    #[tokio::test]
    async fn delta_stream_surfaces_bad_json_as_decode_error() {
        let frames = vec![Ok(SseEvent::Data("not json".to_string()))];
        let mut stream = delta_stream(PROVIDER, futures_util::stream::iter(frames));
        let err = stream.next().await.expect("item").expect_err("must fail");
        assert!(matches!(err, LlmError::Decode { .. }));
    }
}
