//! Static registry of the models the UI can offer per provider.
//!
//! A static table is enough here; provider list endpoints disagree on shape
//! and often omit context-window metadata anyway.

use ls_llm::Provider;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: Provider,
    pub context_window: u32,
    pub max_tokens: u32,
}

const fn model(
    id: &'static str,
    name: &'static str,
    provider: Provider,
    context_window: u32,
    max_tokens: u32,
) -> ModelInfo {
    ModelInfo {
        id,
        name,
        provider,
        context_window,
        max_tokens,
    }
}

pub const MODELS: &[ModelInfo] = &[
    // OpenAI
    model("gpt-5", "GPT-5", Provider::OpenAi, 200_000, 16_384),
    model("gpt-5-mini", "GPT-5 Mini", Provider::OpenAi, 200_000, 16_384),
    model("gpt-5-nano", "GPT-5 Nano", Provider::OpenAi, 200_000, 8_192),
    model("gpt-4.1", "GPT-4.1", Provider::OpenAi, 150_000, 16_384),
    model("gpt-4.1-mini", "GPT-4.1 Mini", Provider::OpenAi, 150_000, 8_192),
    model("o3", "o3", Provider::OpenAi, 200_000, 100_000),
    model("o3-mini", "o3-mini", Provider::OpenAi, 200_000, 65_536),
    model("o4-mini", "o4-mini", Provider::OpenAi, 200_000, 65_536),
    model("gpt-4o", "GPT-4o", Provider::OpenAi, 128_000, 4_096),
    model("gpt-4o-mini", "GPT-4o Mini", Provider::OpenAi, 128_000, 16_384),
    model("gpt-4-turbo", "GPT-4 Turbo", Provider::OpenAi, 128_000, 4_096),
    model("gpt-3.5-turbo", "GPT-3.5 Turbo", Provider::OpenAi, 16_385, 4_096),
    // Anthropic
    model(
        "claude-sonnet-4-5-20250929",
        "Claude Sonnet 4.5",
        Provider::Anthropic,
        200_000,
        8_192,
    ),
    model(
        "claude-haiku-4-5-20251001",
        "Claude Haiku 4.5",
        Provider::Anthropic,
        200_000,
        8_192,
    ),
    model(
        "claude-opus-4-1-20250805",
        "Claude Opus 4.1",
        Provider::Anthropic,
        200_000,
        8_192,
    ),
    model(
        "claude-3-5-sonnet-20241022",
        "Claude 3.5 Sonnet",
        Provider::Anthropic,
        200_000,
        8_192,
    ),
    model(
        "claude-3-haiku-20240307",
        "Claude 3 Haiku",
        Provider::Anthropic,
        200_000,
        4_096,
    ),
    // Gemini
    model("gemini-2.5-pro", "Gemini 2.5 Pro", Provider::Gemini, 2_000_000, 8_192),
    model("gemini-2.5-flash", "Gemini 2.5 Flash", Provider::Gemini, 1_000_000, 8_192),
    model(
        "gemini-2.5-flash-lite",
        "Gemini 2.5 Flash-Lite",
        Provider::Gemini,
        1_000_000,
        8_192,
    ),
    model("gemini-1.5-pro", "Gemini 1.5 Pro", Provider::Gemini, 2_000_000, 8_192),
    model("gemini-1.5-flash", "Gemini 1.5 Flash", Provider::Gemini, 1_000_000, 8_192),
    // Mistral
    model("mistral-large-latest", "Mistral Large", Provider::Mistral, 128_000, 4_096),
    model("mistral-medium-latest", "Mistral Medium", Provider::Mistral, 32_000, 4_096),
    model("mistral-small-latest", "Mistral Small", Provider::Mistral, 32_000, 4_096),
];

pub fn models_for(provider: Option<Provider>) -> Vec<ModelInfo> {
    match provider {
        Some(provider) => MODELS
            .iter()
            .copied()
            .filter(|m| m.provider == provider)
            .collect(),
        None => MODELS.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_provider_has_models() {
        for provider in [
            Provider::OpenAi,
            Provider::Anthropic,
            Provider::Gemini,
            Provider::Mistral,
        ] {
            assert!(!models_for(Some(provider)).is_empty(), "{provider} has no models");
        }
    }

    #[test]
    fn model_ids_are_unique() {
        let ids: HashSet<&str> = MODELS.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), MODELS.len());
    }

    #[test]
    fn provider_filter_only_returns_that_provider() {
        for info in models_for(Some(Provider::Anthropic)) {
            assert_eq!(info.provider, Provider::Anthropic);
        }
    }
}
