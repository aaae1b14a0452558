use crate::client::{TextStream, provider_error, read_success_body, send_with_retry};
use crate::error::{LlmError, Result};
use crate::sse::{NamedEvent, decode_sse_events};
use crate::types::{InvocationRequest, Message, Role};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "Anthropic";

pub(crate) struct AnthropicAdapter {
    http: reqwest::Client,
}

impl AnthropicAdapter {
    pub(crate) fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub(crate) async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        let body = AnthropicRequest::new(request, false);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(ANTHROPIC_MESSAGES_URL)
                .header("x-api-key", &request.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
        })
        .await?;
        let text = read_success_body(PROVIDER, response).await?;
        decode_messages_response(&text)
    }

    pub(crate) async fn invoke_stream(&self, request: &InvocationRequest) -> Result<TextStream> {
        let body = AnthropicRequest::new(request, true);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(ANTHROPIC_MESSAGES_URL)
                .header("x-api-key", &request.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
        })
        .await?;
        if !response.status().is_success() {
            return Err(provider_error(PROVIDER, response).await);
        }
        let events = decode_sse_events(response.bytes_stream());
        Ok(delta_stream(events))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

impl AnthropicRequest {
    /// The `system` turn (if any) is lifted out of the message sequence into
    /// the request-level `system` field; remaining turns keep their order.
    fn new(request: &InvocationRequest, stream: bool) -> Self {
        let mut system: Option<String> = None;
        let mut messages = Vec::with_capacity(request.messages.len());

        for m in &request.messages {
            match m.role {
                Role::System => {
                    let entry = system.get_or_insert_with(String::new);
                    if !entry.is_empty() {
                        entry.push('\n');
                    }
                    entry.push_str(&m.content);
                }
                Role::User | Role::Assistant => messages.push(AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                }),
            }
        }

        Self {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system,
            messages,
            stream: if stream { Some(true) } else { None },
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

fn decode_messages_response(body: &str) -> Result<String> {
    let parsed: AnthropicResponse = serde_json::from_str(body).map_err(|e| LlmError::Decode {
        provider: PROVIDER,
        detail: e.to_string(),
    })?;
    let block = parsed.content.into_iter().next().ok_or(LlmError::Decode {
        provider: PROVIDER,
        detail: "response missing content blocks".to_string(),
    })?;
    block.text.ok_or(LlmError::Decode {
        provider: PROVIDER,
        detail: "content block missing text".to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: BlockDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

/// Text deltas from Anthropic's named event stream: `content_block_delta`
/// events carry text; `message_stop` ends the stream; everything else
/// (message_start, pings, usage deltas) is skipped.
fn delta_stream<S>(events: S) -> TextStream
where
    S: Stream<Item = Result<NamedEvent>> + Send + 'static,
{
    let events = Box::pin(events);
    let stream = futures_util::stream::unfold(events, |mut events| async move {
        loop {
            let next = events.as_mut().next().await?;
            let (event, data) = match next {
                Ok(v) => v,
                Err(e) => return Some((Err(e), events)),
            };
            match event.as_str() {
                "content_block_delta" => {
                    let parsed: ContentBlockDelta = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            return Some((
                                Err(LlmError::Decode {
                                    provider: PROVIDER,
                                    detail: format!("stream delta: {e}"),
                                }),
                                events,
                            ));
                        }
                    };
                    if let BlockDelta::TextDelta { text } = parsed.delta {
                        if !text.is_empty() {
                            return Some((Ok(text), events));
                        }
                    }
                }
                "message_stop" => return None,
                _ => {}
            }
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    fn request_with(messages: Vec<Message>) -> InvocationRequest {
        InvocationRequest::new(Provider::Anthropic, "claude-3-5-sonnet", messages, "key", 1000)
    }

    #[test]
    fn system_turn_is_lifted_out_of_the_sequence() {
        let req = request_with(vec![
            Message::new(Role::System, "be brief"),
            Message::new(Role::User, "hi"),
            Message::new(Role::Assistant, "hello"),
        ]);
        let wire = AnthropicRequest::new(&req, false);
        assert_eq!(wire.system.as_deref(), Some("be brief"));
        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.messages[1].role, "assistant");
    }

    #[test]
    fn no_system_field_without_system_turn() {
        let req = request_with(vec![Message::new(Role::User, "hi")]);
        let wire = AnthropicRequest::new(&req, false);
        assert!(wire.system.is_none());
        let encoded = serde_json::to_value(&wire).expect("serialize");
        assert!(encoded.get("system").is_none());
        assert_eq!(encoded["max_tokens"], 1000);
    }

    #[test]
    fn decode_reads_first_content_block_text() {
        let body = r#"{"content":[{"type":"text","text":"answer"}]}"#;
        assert_eq!(decode_messages_response(body).expect("decode"), "answer");
    }

    #[test]
    fn decode_fails_on_empty_content() {
        let err = decode_messages_response(r#"{"content":[]}"#).expect_err("must fail");
        assert!(matches!(err, LlmError::Decode { .. }));
    }

    #[tokio::test]
    async fn delta_stream_ends_on_message_stop() {
        let frames: Vec<Result<NamedEvent>> = vec![
            Ok(("message_start".to_string(), "{}".to_string())),
            Ok((
                "content_block_delta".to_string(),
                r#"{"delta":{"type":"text_delta","text":"Hel"}}"#.to_string(),
            )),
            Ok((
                "content_block_delta".to_string(),
                r#"{"delta":{"type":"text_delta","text":"lo"}}"#.to_string(),
            )),
            Ok(("message_stop".to_string(), "{}".to_string())),
        ];
        let mut stream = delta_stream(futures_util::stream::iter(frames));
        assert_eq!(stream.next().await.expect("delta").expect("ok"), "Hel");
        assert_eq!(stream.next().await.expect("delta").expect("ok"), "lo");
        assert!(stream.next().await.is_none());
    }
}
