//! Multi-provider LLM invocation engine for llmselect.
//!
//! Normalizes the OpenAI, Anthropic, Gemini and Mistral wire protocols into
//! one internal call shape, executes batches of calls concurrently with
//! per-branch failure containment, and relays token-level streaming output.
//! Pure HTTP client layer; no server dependencies.

mod anthropic;
mod client;
mod error;
mod fanout;
mod gateway;
mod gemini;
mod mistral;
mod openai;
mod sse;
mod types;

pub use client::{InvocationClient, Invoker, REQUEST_TIMEOUT_SECS, TextStream};
pub use error::{GENERIC_FAILURE_MESSAGE, LlmError, Result};
pub use fanout::{CredentialResolver, FanOutCoordinator, ProviderModel};
pub use gateway::GatewayConfig;
pub use types::{
    CompareEvent, InvocationRequest, InvocationResult, Message, Provider, Role, estimate_tokens,
    sanitize_content,
};
