use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Caller-facing message for failures whose detail must stay internal.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Provider request failed. Please check your API key and try again.";

/// Error taxonomy for the invocation engine.
///
/// Branch-local failures (`Credential`, `Transport`, `Timeout`, `Provider`,
/// `Decode`) are converted to data at the fan-out boundary; `InvalidInput`
/// and `Gateway` reject the whole call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no usable credential: {0}")]
    Credential(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Non-2xx response from the upstream provider. `body` carries the
    /// provider's JSON error body when parseable, raw text otherwise.
    /// It is for internal logs only and never reaches the external caller.
    #[error("{provider} API error: status={status}")]
    Provider {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("malformed response from {provider}: {detail}")]
    Decode {
        provider: &'static str,
        detail: String,
    },

    /// Unified-gateway misconfiguration (e.g. missing deployment mapping).
    #[error("gateway configuration error: {0}")]
    Gateway(String),
}

impl LlmError {
    /// Caller-safe message. Upstream bodies and infrastructure detail stay
    /// out of responses; the full error is logged at the fan-out boundary.
    pub fn public_message(&self) -> String {
        match self {
            LlmError::InvalidInput(msg) => msg.clone(),
            LlmError::Credential(msg) => msg.clone(),
            LlmError::Timeout(secs) => format!("Provider request timed out after {secs} seconds."),
            LlmError::Transport(_) | LlmError::Provider { .. } => {
                GENERIC_FAILURE_MESSAGE.to_string()
            }
            LlmError::Decode { provider, .. } => format!("Malformed response from {provider}"),
            LlmError::Gateway(msg) => msg.clone(),
        }
    }

    /// True for failures the client retries: connection errors and the
    /// retryable status codes. Timeouts are terminal (the per-call budget is
    /// already spent).
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Provider { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(crate::client::REQUEST_TIMEOUT_SECS)
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode {
            provider: "upstream",
            detail: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_public_message_hides_body() {
        let err = LlmError::Provider {
            provider: "OpenAI",
            status: 401,
            body: "{\"error\":\"invalid api key sk-leaked\"}".to_string(),
        };
        let public = err.public_message();
        assert!(!public.contains("sk-leaked"));
        assert!(public.contains("check your API key"));
    }

    #[test]
    fn retryable_statuses_match_policy() {
        for status in [429u16, 500, 502, 503, 504] {
            let err = LlmError::Provider {
                provider: "OpenAI",
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "status {status} should retry");
        }
        for status in [400u16, 401, 403, 404, 422] {
            let err = LlmError::Provider {
                provider: "OpenAI",
                status,
                body: String::new(),
            };
            assert!(!err.is_retryable(), "status {status} must not retry");
        }
        assert!(!LlmError::Timeout(30).is_retryable());
    }
}
