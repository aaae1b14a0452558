//! Per-request credential resolution.
//!
//! A key the user stored for a provider wins over the server-level fallback
//! from config or environment. Resolved keys flow straight into the request
//! and are never logged.

use crate::store::Store;
use async_trait::async_trait;
use ls_llm::{CredentialResolver, LlmError, Provider};
use std::collections::HashMap;

pub struct StoredKeyResolver {
    store: Store,
    fallback: HashMap<Provider, String>,
    user_id: String,
}

impl StoredKeyResolver {
    pub fn new(store: Store, fallback: HashMap<Provider, String>, user_id: String) -> Self {
        Self {
            store,
            fallback,
            user_id,
        }
    }
}

#[async_trait]
impl CredentialResolver for StoredKeyResolver {
    async fn resolve(&self, provider: Provider) -> ls_llm::Result<String> {
        let stored = self
            .store
            .get_api_key(&self.user_id, provider)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, provider = %provider, "stored key lookup failed");
                LlmError::Credential(format!("could not look up key for provider '{provider}'"))
            })?;
        if let Some(key) = stored {
            return Ok(key);
        }
        if let Some(key) = self.fallback.get(&provider) {
            return Ok(key.clone());
        }
        Err(LlmError::Credential(format!(
            "API key for provider '{provider}' is not configured"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user_key() -> Store {
        Store::open_in_memory().expect("open")
    }

    #[tokio::test]
    async fn stored_key_wins_over_fallback() {
        let store = store_with_user_key();
        store
            .set_api_keys("alice", vec![(Provider::OpenAi, "sk-user".to_string())])
            .await
            .expect("set");
        let fallback = HashMap::from([(Provider::OpenAi, "sk-server".to_string())]);
        let resolver = StoredKeyResolver::new(store, fallback, "alice".to_string());

        let key = resolver.resolve(Provider::OpenAi).await.expect("resolve");
        assert_eq!(key, "sk-user");
    }

    #[tokio::test]
    async fn fallback_covers_providers_without_stored_key() {
        let store = store_with_user_key();
        let fallback = HashMap::from([(Provider::Gemini, "sk-server".to_string())]);
        let resolver = StoredKeyResolver::new(store, fallback, "alice".to_string());

        let key = resolver.resolve(Provider::Gemini).await.expect("resolve");
        assert_eq!(key, "sk-server");
    }

    #[tokio::test]
    async fn unconfigured_provider_is_a_credential_error() {
        let store = store_with_user_key();
        let resolver = StoredKeyResolver::new(store, HashMap::new(), "alice".to_string());

        let err = resolver
            .resolve(Provider::Mistral)
            .await
            .expect_err("no key anywhere");
        assert!(matches!(err, LlmError::Credential(_)));
        assert!(err.public_message().contains("mistral"));
    }
}
