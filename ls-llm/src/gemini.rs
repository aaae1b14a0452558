use crate::client::{TextStream, provider_error, read_success_body, send_with_retry};
use crate::error::{LlmError, Result};
use crate::sse::{SseEvent, decode_sse_data};
use crate::types::{InvocationRequest, Role};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const PROVIDER: &str = "Gemini";

pub(crate) struct GeminiAdapter {
    http: reqwest::Client,
}

impl GeminiAdapter {
    pub(crate) fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub(crate) async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        let url = format!("{GEMINI_BASE_URL}/{}:generateContent", request.model);
        let body = GeminiRequest::new(request);
        // Gemini authenticates via a query parameter rather than a header.
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(&url)
                .query(&[("key", request.api_key.as_str())])
                .json(&body)
        })
        .await?;
        let text = read_success_body(PROVIDER, response).await?;
        decode_generate_response(&text)
    }

    pub(crate) async fn invoke_stream(&self, request: &InvocationRequest) -> Result<TextStream> {
        let url = format!("{GEMINI_BASE_URL}/{}:streamGenerateContent", request.model);
        let body = GeminiRequest::new(request);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(&url)
                .query(&[("alt", "sse"), ("key", request.api_key.as_str())])
                .json(&body)
        })
        .await?;
        if !response.status().is_success() {
            return Err(provider_error(PROVIDER, response).await);
        }
        let sse = decode_sse_data(response.bytes_stream());
        Ok(delta_stream(sse))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
}

impl GeminiRequest {
    /// System turns are lifted into `systemInstruction`; `assistant` becomes
    /// Gemini's `model` role, everything else is `user`.
    fn new(request: &InvocationRequest) -> Self {
        let mut system: Option<String> = None;
        let mut contents = Vec::with_capacity(request.messages.len());

        for m in &request.messages {
            match m.role {
                Role::System => {
                    let entry = system.get_or_insert_with(String::new);
                    if !entry.is_empty() {
                        entry.push('\n');
                    }
                    entry.push_str(&m.content);
                }
                Role::User | Role::Assistant => contents.push(GeminiContent {
                    role: if m.role == Role::Assistant {
                        "model".to_string()
                    } else {
                        "user".to_string()
                    },
                    parts: vec![GeminiPart {
                        text: Some(m.content.clone()),
                    }],
                }),
            }
        }

        Self {
            contents,
            system_instruction: system.map(|text| GeminiSystemInstruction {
                parts: vec![GeminiPart { text: Some(text) }],
            }),
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

fn extract_candidate_text(parsed: GeminiResponse) -> Option<String> {
    parsed
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .next()?
        .text
}

fn decode_generate_response(body: &str) -> Result<String> {
    let parsed: GeminiResponse = serde_json::from_str(body).map_err(|e| LlmError::Decode {
        provider: PROVIDER,
        detail: e.to_string(),
    })?;
    extract_candidate_text(parsed).ok_or(LlmError::Decode {
        provider: PROVIDER,
        detail: "response missing candidates[0].content.parts[0].text".to_string(),
    })
}

/// Each `data:` frame is a full GenerateContentResponse carrying one text
/// delta; frames without text (safety metadata, usage) are skipped. The
/// stream ends on connection close.
fn delta_stream<S>(sse: S) -> TextStream
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    let sse = Box::pin(sse);
    let stream = futures_util::stream::unfold(sse, |mut sse| async move {
        loop {
            let next = sse.as_mut().next().await?;
            match next {
                Ok(SseEvent::Data(data)) => {
                    let parsed: GeminiResponse = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            return Some((
                                Err(LlmError::Decode {
                                    provider: PROVIDER,
                                    detail: format!("stream chunk: {e}"),
                                }),
                                sse,
                            ));
                        }
                    };
                    match extract_candidate_text(parsed) {
                        Some(text) if !text.is_empty() => return Some((Ok(text), sse)),
                        _ => continue,
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
    use crate::types::{Message, Provider};

    fn request_with(messages: Vec<Message>) -> InvocationRequest {
        InvocationRequest::new(Provider::Gemini, "gemini-1.5-pro", messages, "key", 1000)
    }

    #[test]
    fn assistant_role_becomes_model() {
        let req = request_with(vec![
            Message::new(Role::User, "hi"),
            Message::new(Role::Assistant, "hello"),
        ]);
        let wire = GeminiRequest::new(&req);
        assert_eq!(wire.contents[0].role, "user");
        assert_eq!(wire.contents[1].role, "model");
    }

    #[test]
    fn system_turn_becomes_system_instruction() {
        let req = request_with(vec![
            Message::new(Role::System, "be brief"),
            Message::new(Role::User, "hi"),
        ]);
        let wire = GeminiRequest::new(&req);
        assert_eq!(wire.contents.len(), 1);
        let encoded = serde_json::to_value(&wire).expect("serialize");
        assert_eq!(encoded["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(encoded["generationConfig"]["maxOutputTokens"], 1000);
    }

    #[test]
    fn decode_reads_nested_candidate_text() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"answer"}]}}]}"#;
        assert_eq!(decode_generate_response(body).expect("decode"), "answer");
    }

    #[test]
    fn decode_fails_on_missing_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[]}}]}"#;
        let err = decode_generate_response(body).expect_err("must fail");
        assert!(matches!(err, LlmError::Decode { .. }));
    }

    #[tokio::test]
    async fn delta_stream_skips_textless_frames() {
        let frames = vec![
            Ok(SseEvent::Data(
                r#"{"candidates":[{"content":{"parts":[{"text":"a"}]}}]}"#.to_string(),
            )),
            Ok(SseEvent::Data(r#"{"candidates":[]}"#.to_string())),
            Ok(SseEvent::Data(
                r#"{"candidates":[{"content":{"parts":[{"text":"b"}]}}]}"#.to_string(),
            )),
        ];
        let mut stream = delta_stream(futures_util::stream::iter(frames));
        assert_eq!(stream.next().await.expect("delta").expect("ok"), "a");
        assert_eq!(stream.next().await.expect("delta").expect("ok"), "b");
        assert!(stream.next().await.is_none());
    }
}
