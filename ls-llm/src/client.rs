use crate::anthropic::AnthropicAdapter;
use crate::error::{LlmError, Result};
use crate::gateway::{GatewayAdapter, GatewayConfig};
use crate::gemini::GeminiAdapter;
use crate::mistral::MistralAdapter;
use crate::openai::OpenAiAdapter;
use crate::types::{InvocationRequest, Provider};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Per-call budget covering connect, request and full body read.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 300;

/// Lazy, forward-only sequence of text deltas. Single pass; the caller must
/// drain it to release the underlying connection.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Seam between the fan-out coordinator and the HTTP layer. Production code
/// uses [`InvocationClient`]; tests substitute deterministic stubs.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, request: &InvocationRequest) -> Result<String>;
    async fn invoke_stream(&self, request: &InvocationRequest) -> Result<TextStream>;
}

/// One long-lived, connection-pooled transport shared across calls and
/// branches. Dispatches to the adapter matching the request's provider, or
/// to the unified gateway when one is configured.
#[derive(Clone)]
pub struct InvocationClient {
    http: reqwest::Client,
    gateway: Option<Arc<GatewayConfig>>,
}

impl InvocationClient {
    pub fn new() -> Self {
        Self::with_gateway(None)
    }

    pub fn with_gateway(gateway: Option<GatewayConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            gateway: gateway.map(Arc::new),
        }
    }

    fn prepare(request: &InvocationRequest) -> Result<InvocationRequest> {
        if request.messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "message list must not be empty".to_string(),
            ));
        }
        let mut sanitized = request.clone();
        sanitized.messages = request.messages.iter().map(|m| m.sanitized()).collect();
        Ok(sanitized)
    }
}

impl Default for InvocationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for InvocationClient {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(provider = %request.provider, model = %request.model)
    )]
    async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        let request = Self::prepare(request)?;
        if let Some(gateway) = self.gateway.clone() {
            return GatewayAdapter::new(self.http.clone(), gateway)
                .invoke(&request)
                .await;
        }
        match request.provider {
            Provider::OpenAi => OpenAiAdapter::new(self.http.clone()).invoke(&request).await,
            Provider::Anthropic => {
                AnthropicAdapter::new(self.http.clone())
                    .invoke(&request)
                    .await
            }
            Provider::Gemini => GeminiAdapter::new(self.http.clone()).invoke(&request).await,
            Provider::Mistral => {
                MistralAdapter::new(self.http.clone())
                    .invoke(&request)
                    .await
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(provider = %request.provider, model = %request.model)
    )]
    async fn invoke_stream(&self, request: &InvocationRequest) -> Result<TextStream> {
        let request = Self::prepare(request)?;
        if let Some(gateway) = self.gateway.clone() {
            return GatewayAdapter::new(self.http.clone(), gateway)
                .invoke_stream(&request)
                .await;
        }
        match request.provider {
            Provider::OpenAi => {
                OpenAiAdapter::new(self.http.clone())
                    .invoke_stream(&request)
                    .await
            }
            Provider::Anthropic => {
                AnthropicAdapter::new(self.http.clone())
                    .invoke_stream(&request)
                    .await
            }
            Provider::Gemini => {
                GeminiAdapter::new(self.http.clone())
                    .invoke_stream(&request)
                    .await
            }
            Provider::Mistral => {
                MistralAdapter::new(self.http.clone())
                    .invoke_stream(&request)
                    .await
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1))
}

fn retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Send with bounded automatic retry: up to [`MAX_ATTEMPTS`] attempts,
/// exponential backoff from [`BACKOFF_BASE_MS`], retried only on connection
/// errors and {429, 500, 502, 503, 504}. Timeouts and other 4xx statuses
/// surface immediately. `build` constructs a fresh request per attempt.
pub(crate) async fn send_with_retry<F>(provider: &'static str, build: F) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let mut attempt: u32 = 1;
    loop {
        match build().send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if retryable_status(status) && attempt < MAX_ATTEMPTS {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        provider,
                        status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retryable status; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Ok(response);
            }
            Err(e) if e.is_connect() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    provider,
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connection error; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Convert a non-2xx response into a structured provider error. The body is
/// kept as the provider's JSON error when parseable, raw text otherwise.
pub(crate) async fn provider_error(
    provider: &'static str,
    response: reqwest::Response,
) -> LlmError {
    let status = response.status().as_u16();
    let raw = response.text().await.unwrap_or_default();
    let body = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => raw,
    };
    LlmError::Provider {
        provider,
        status,
        body,
    }
}

/// Read a 2xx response body, or produce the structured provider error.
pub(crate) async fn read_success_body(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<String> {
    if !response.status().is_success() {
        return Err(provider_error(provider, response).await);
    }
    Ok(response.text().await?)
}
