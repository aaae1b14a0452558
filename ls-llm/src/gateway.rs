use crate::client::{TextStream, provider_error, read_success_body, send_with_retry};
use crate::error::{LlmError, Result};
use crate::openai::{OpenAiChatRequest, decode_chat_completion, delta_stream};
use crate::sse::decode_sse_data;
use crate::types::InvocationRequest;
use std::collections::HashMap;
use std::sync::Arc;

const PROVIDER: &str = "Gateway";

/// Unified-gateway mode: every provider is fronted by one OpenAI-compatible
/// endpoint addressed by deployment name. A model with no deployment mapping
/// is a configuration error, not a transient failure.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    /// model id -> deployment name
    pub deployments: HashMap<String, String>,
}

impl GatewayConfig {
    fn deployment_for(&self, model: &str) -> Result<&str> {
        self.deployments
            .get(model)
            .map(String::as_str)
            .ok_or_else(|| {
                LlmError::Gateway(format!("no gateway deployment mapping for model '{model}'"))
            })
    }

    fn url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint.trim_end_matches('/'),
            deployment,
            self.api_version
        )
    }
}

pub(crate) struct GatewayAdapter {
    http: reqwest::Client,
    config: Arc<GatewayConfig>,
}

impl GatewayAdapter {
    pub(crate) fn new(http: reqwest::Client, config: Arc<GatewayConfig>) -> Self {
        Self { http, config }
    }

    pub(crate) async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        let deployment = self.config.deployment_for(&request.model)?;
        let url = self.config.url(deployment);
        // Routing is by deployment; the body keeps the real model name so the
        // token-limit field branch still follows the underlying model family.
        let body =
            OpenAiChatRequest::new(&request.model, &request.messages, request.max_tokens, false);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
        })
        .await?;
        let text = read_success_body(PROVIDER, response).await?;
        decode_chat_completion(PROVIDER, &text)
    }

    pub(crate) async fn invoke_stream(&self, request: &InvocationRequest) -> Result<TextStream> {
        let deployment = self.config.deployment_for(&request.model)?;
        let url = self.config.url(deployment);
        let body =
            OpenAiChatRequest::new(&request.model, &request.messages, request.max_tokens, true);
        let response = send_with_retry(PROVIDER, || {
            self.http
                .post(&url)
                .bearer_auth(&self.config.api_key)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            endpoint: "https://foundry.example.com/".to_string(),
            api_key: "gw-key".to_string(),
            api_version: "2024-02-15-preview".to_string(),
            deployments: HashMap::from([(
                "gpt-4o".to_string(),
                "gpt-4o-deployment".to_string(),
            )]),
        }
    }

    #[test]
    fn mapped_model_builds_deployment_url() {
        let cfg = config();
        let deployment = cfg.deployment_for("gpt-4o").expect("mapped");
        assert_eq!(
            cfg.url(deployment),
            "https://foundry.example.com/openai/deployments/gpt-4o-deployment/chat/completions?api-version=2024-02-15-preview"
        );
    }

    #[test]
    fn missing_mapping_is_a_gateway_config_error() {
        let err = config().deployment_for("claude-3-opus").expect_err("unmapped");
        assert!(matches!(err, LlmError::Gateway(_)));
        assert!(err.to_string().contains("claude-3-opus"));
    }
}
