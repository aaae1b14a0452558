//! llmselect configuration loader.
//!
//! Reads `llmselect.toml`, applies environment overrides, then validates.
//! Every section has workable defaults so a missing file still boots a
//! local server.

use ls_llm::{GatewayConfig, Provider};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "llmselect.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8087".to_string()
}

fn default_db_path() -> String {
    "llmselect.db".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    120
}

fn default_http_max_in_flight() -> usize {
    512
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Completion token cap applied to every provider call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> u32 {
    1000
}

/// Server-level fallback keys, used when a user has not stored their own key
/// for a provider. Values here are secrets and must never be logged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub mistral_api_key: Option<String>,
}

/// Unified-gateway section. When enabled, every provider call is routed
/// through one OpenAI-compatible endpoint addressed by deployment name.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gateway_api_version")]
    pub api_version: String,
    /// model id -> deployment name
    #[serde(default)]
    pub deployments: HashMap<String, String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            api_key: String::new(),
            api_version: default_gateway_api_version(),
            deployments: HashMap::new(),
        }
    }
}

fn default_gateway_api_version() -> String {
    "2024-02-15-preview".to_string()
}

impl AppConfig {
    pub async fn load_with_path(config_path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = match config_path {
            Some(path) => path,
            None => match std::env::var("LLMSELECT_CONFIG") {
                Ok(v) => PathBuf::from(v),
                Err(_) => PathBuf::from(DEFAULT_CONFIG_FILE),
            },
        };
        let mut cfg = Self::read_file(&path).await?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub async fn load(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(config_path).await?;
        Ok(cfg)
    }

    async fn read_file(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let cfg: Self = toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read {}: {e}", path.display())),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LLMSELECT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("LLMSELECT_DB_PATH") {
            self.server.db_path = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("GEMINI_API_KEY") {
            self.keys.gemini_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("MISTRAL_API_KEY") {
            self.keys.mistral_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("GATEWAY_ENDPOINT") {
            self.gateway.enabled = true;
            self.gateway.endpoint = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_API_KEY") {
            self.gateway.api_key = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_API_VERSION") {
            self.gateway.api_version = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.llm.max_tokens == 0 {
            return Err(anyhow::anyhow!("llm.max_tokens must be greater than zero"));
        }
        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))?;
        if self.gateway.enabled {
            if self.gateway.endpoint.trim().is_empty() {
                return Err(anyhow::anyhow!("gateway.enabled requires gateway.endpoint"));
            }
            if self.gateway.api_key.trim().is_empty() {
                return Err(anyhow::anyhow!("gateway.enabled requires gateway.api_key"));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> std::net::SocketAddr {
        // validate() has already parsed this.
        self.server
            .bind_addr
            .parse()
            .unwrap_or_else(|_| std::net::SocketAddr::from(([127, 0, 0, 1], 8087)))
    }

    /// Server-level keys by provider, blank entries dropped.
    pub fn fallback_keys(&self) -> HashMap<Provider, String> {
        let mut keys = HashMap::new();
        let pairs = [
            (Provider::OpenAi, &self.keys.openai_api_key),
            (Provider::Anthropic, &self.keys.anthropic_api_key),
            (Provider::Gemini, &self.keys.gemini_api_key),
            (Provider::Mistral, &self.keys.mistral_api_key),
        ];
        for (provider, key) in pairs {
            if let Some(key) = key {
                if !key.trim().is_empty() {
                    keys.insert(provider, key.trim().to_string());
                }
            }
        }
        keys
    }

    pub fn gateway_config(&self) -> Option<GatewayConfig> {
        if !self.gateway.enabled {
            return None;
        }
        Some(GatewayConfig {
            endpoint: self.gateway.endpoint.clone(),
            api_key: self.gateway.api_key.clone(),
            api_version: self.gateway.api_version.clone(),
            deployments: self.gateway.deployments.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8087");
        assert_eq!(cfg.llm.max_tokens, 1000);
        assert!(!cfg.gateway.enabled);
    }

    #[test]
    fn parses_full_config() {
        let raw = r#"
            [server]
            bind_addr = "0.0.0.0:9000"

            [llm]
            max_tokens = 512

            [keys]
            openai_api_key = "sk-test"

            [gateway]
            enabled = true
            endpoint = "https://foundry.example.com"
            api_key = "gw-key"

            [gateway.deployments]
            "gpt-4o" = "gpt-4o-deployment"
        "#;
        let cfg: AppConfig = toml::from_str(raw).expect("parse");
        cfg.validate().expect("validate");
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.llm.max_tokens, 512);
        let keys = cfg.fallback_keys();
        assert_eq!(keys.get(&Provider::OpenAi).map(String::as_str), Some("sk-test"));
        assert!(!keys.contains_key(&Provider::Anthropic));
        let gateway = cfg.gateway_config().expect("gateway enabled");
        assert_eq!(
            gateway.deployments.get("gpt-4o").map(String::as_str),
            Some("gpt-4o-deployment")
        );
    }

    #[test]
    fn gateway_without_endpoint_is_rejected() {
        let raw = r#"
            [gateway]
            enabled = true
            api_key = "gw-key"
        "#;
        let cfg: AppConfig = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_max_tokens_is_rejected() {
        let raw = "[llm]\nmax_tokens = 0\n";
        let cfg: AppConfig = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());
    }
}
