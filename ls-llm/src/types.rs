use serde::{Deserialize, Serialize};

/// The closed set of supported providers. Anything outside this enum is
/// rejected at the request boundary, so adapter dispatch never has an
/// "unknown provider" arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Mistral,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Mistral => "mistral",
        }
    }

    /// Human-facing label used in error messages and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Gemini => "Gemini",
            Provider::Mistral => "Mistral",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "gemini" => Ok(Provider::Gemini),
            "mistral" => Ok(Provider::Mistral),
            other => Err(format!("unsupported provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Copy of this message with sanitized content.
    pub fn sanitized(&self) -> Self {
        Self {
            role: self.role,
            content: sanitize_content(&self.content),
        }
    }
}

/// Strip control characters (everything but newline and tab), then trim
/// surrounding whitespace. Stripping before trimming keeps the function
/// idempotent: the trimmed output contains neither control characters nor
/// boundary whitespace, so a second pass is a no-op.
pub fn sanitize_content(content: &str) -> String {
    let stripped: String = content
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    stripped.trim().to_string()
}

/// Rough token estimate: ~4 characters per token for English text. Counts
/// characters, not bytes, so multibyte text is not inflated. Display metric
/// only; precise tokenization is out of scope.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32 / 4).max(1)
}

/// One normalized call against one provider. Immutable once constructed.
#[derive(Clone)]
pub struct InvocationRequest {
    pub provider: Provider,
    pub model: String,
    pub messages: Vec<Message>,
    pub api_key: String,
    pub max_tokens: u32,
}

impl InvocationRequest {
    pub fn new(
        provider: Provider,
        model: impl Into<String>,
        messages: Vec<Message>,
        api_key: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            messages,
            api_key: api_key.into(),
            max_tokens,
        }
    }
}

// Manual Debug: the api key must never reach logs.
impl std::fmt::Debug for InvocationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationRequest")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("api_key", &"<redacted>")
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Outcome of one branch of a fan-out call. `time` is elapsed milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub provider: Provider,
    pub model: String,
    pub response: String,
    #[serde(rename = "time")]
    pub elapsed_ms: f64,
    pub tokens: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl InvocationResult {
    pub fn completed(provider: Provider, model: String, response: String, elapsed_ms: f64) -> Self {
        let tokens = estimate_tokens(&response);
        Self {
            provider,
            model,
            response,
            elapsed_ms,
            tokens,
            error: false,
        }
    }

    pub fn failed(provider: Provider, model: String, message: String) -> Self {
        Self {
            provider,
            model,
            response: message,
            elapsed_ms: 0.0,
            tokens: 0,
            error: true,
        }
    }
}

/// Events multiplexed onto the fan-out stream channel. Per branch, zero or
/// more `Chunk`s followed by exactly one `Complete` or `BranchError`; `Start`
/// precedes all branch output and `Done` follows every branch terminal.
#[derive(Debug, Clone)]
pub enum CompareEvent {
    Start {
        total: usize,
    },
    Chunk {
        provider: Provider,
        model: String,
        text: String,
    },
    Complete {
        result: InvocationResult,
    },
    BranchError {
        provider: Provider,
        model: String,
        message: String,
    },
    Done,
}
