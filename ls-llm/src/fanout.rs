//! Multi-provider fan-out: one concurrent invocation per (provider, model)
//! pair, with per-branch failure containment.

use crate::client::Invoker;
use crate::error::{GENERIC_FAILURE_MESSAGE, LlmError, Result};
use crate::types::{CompareEvent, InvocationRequest, InvocationResult, Message, Provider, Role};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Bounded: a consumer slower than the producers applies backpressure
/// instead of buffering whole responses in memory.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Resolves a decrypted API key for a provider, scoped to the requesting
/// user. Failures short-circuit that provider's branch only.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, provider: Provider) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderModel {
    pub provider: Provider,
    pub model: String,
}

pub struct FanOutCoordinator {
    invoker: Arc<dyn Invoker>,
}

impl FanOutCoordinator {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self { invoker }
    }

    /// Run one invocation per pair concurrently and wait for every branch to
    /// settle. A branch failure (credential, transport, provider, decode)
    /// becomes a failed [`InvocationResult`]; it never aborts siblings.
    /// Duplicate pairs run as independent branches. Callers should match
    /// results by provider+model, not position.
    #[tracing::instrument(level = "info", skip_all, fields(branches = pairs.len()))]
    pub async fn compare(
        &self,
        prompt: &str,
        pairs: &[ProviderModel],
        resolver: Arc<dyn CredentialResolver>,
        max_tokens: u32,
    ) -> Result<Vec<InvocationResult>> {
        if pairs.is_empty() {
            return Err(LlmError::InvalidInput(
                "at least one provider is required".to_string(),
            ));
        }
        let messages = vec![Message::new(Role::User, prompt)];

        let handles: Vec<_> = pairs
            .iter()
            .cloned()
            .map(|pair| {
                let invoker = self.invoker.clone();
                let resolver = resolver.clone();
                let messages = messages.clone();
                tokio::spawn(async move {
                    run_branch(invoker, resolver, pair, messages, max_tokens).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (handle, pair) in handles.into_iter().zip(pairs.iter()) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        provider = %pair.provider,
                        model = %pair.model,
                        error = %e,
                        "comparison branch task failed"
                    );
                    results.push(InvocationResult::failed(
                        pair.provider,
                        pair.model.clone(),
                        GENERIC_FAILURE_MESSAGE.to_string(),
                    ));
                }
            }
        }
        Ok(results)
    }

    /// Streaming fan-out: per-branch chunk events multiplexed onto one
    /// bounded channel. Emits `Start` before any branch output and `Done`
    /// after every branch has produced its terminal `Complete`/`BranchError`.
    /// Within a branch order is preserved; across branches interleaving is
    /// arbitrary. Dropping the receiver cancels in-flight branches
    /// cooperatively.
    #[tracing::instrument(level = "info", skip_all, fields(branches = pairs.len()))]
    pub fn compare_stream(
        &self,
        prompt: &str,
        pairs: &[ProviderModel],
        resolver: Arc<dyn CredentialResolver>,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<CompareEvent>> {
        if pairs.is_empty() {
            return Err(LlmError::InvalidInput(
                "at least one provider is required".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let invoker = self.invoker.clone();
        let pairs = pairs.to_vec();
        let messages = vec![Message::new(Role::User, prompt)];

        tokio::spawn(async move {
            let total = pairs.len();
            if tx.send(CompareEvent::Start { total }).await.is_err() {
                return;
            }

            let mut branches = tokio::task::JoinSet::new();
            for pair in pairs {
                let invoker = invoker.clone();
                let resolver = resolver.clone();
                let messages = messages.clone();
                let tx = tx.clone();
                branches.spawn(async move {
                    run_stream_branch(invoker, resolver, pair, messages, max_tokens, tx).await;
                });
            }
            while let Some(joined) = branches.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "streaming branch task failed");
                }
            }

            let _ = tx.send(CompareEvent::Done).await;
        });

        Ok(rx)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

async fn run_branch(
    invoker: Arc<dyn Invoker>,
    resolver: Arc<dyn CredentialResolver>,
    pair: ProviderModel,
    messages: Vec<Message>,
    max_tokens: u32,
) -> InvocationResult {
    let api_key = match resolver.resolve(pair.provider).await {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(provider = %pair.provider, model = %pair.model, error = %e, "credential resolution failed");
            return InvocationResult::failed(pair.provider, pair.model, e.public_message());
        }
    };
    let request =
        InvocationRequest::new(pair.provider, pair.model.clone(), messages, api_key, max_tokens);

    let started = Instant::now();
    match invoker.invoke(&request).await {
        Ok(text) => {
            InvocationResult::completed(pair.provider, pair.model, text, elapsed_ms(started))
        }
        Err(e) => {
            tracing::error!(provider = %pair.provider, model = %pair.model, error = %e, "provider branch failed");
            InvocationResult::failed(pair.provider, pair.model, e.public_message())
        }
    }
}

async fn run_stream_branch(
    invoker: Arc<dyn Invoker>,
    resolver: Arc<dyn CredentialResolver>,
    pair: ProviderModel,
    messages: Vec<Message>,
    max_tokens: u32,
    tx: mpsc::Sender<CompareEvent>,
) {
    let started = Instant::now();

    let api_key = match resolver.resolve(pair.provider).await {
        Ok(key) => key,
        Err(e) => {
            send_branch_error(&tx, &pair, &e).await;
            return;
        }
    };
    let request =
        InvocationRequest::new(pair.provider, pair.model.clone(), messages, api_key, max_tokens);

    let mut stream = match invoker.invoke_stream(&request).await {
        Ok(stream) => stream,
        Err(e) => {
            send_branch_error(&tx, &pair, &e).await;
            return;
        }
    };

    let mut full_text = String::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(text) => {
                full_text.push_str(&text);
                let event = CompareEvent::Chunk {
                    provider: pair.provider,
                    model: pair.model.clone(),
                    text,
                };
                if tx.send(event).await.is_err() {
                    // Consumer is gone; stop reading so the connection is
                    // released. Partial output is discarded, not persisted.
                    return;
                }
            }
            Err(e) => {
                send_branch_error(&tx, &pair, &e).await;
                return;
            }
        }
    }

    let result = InvocationResult::completed(
        pair.provider,
        pair.model.clone(),
        full_text,
        elapsed_ms(started),
    );
    let _ = tx.send(CompareEvent::Complete { result }).await;
}

async fn send_branch_error(tx: &mpsc::Sender<CompareEvent>, pair: &ProviderModel, error: &LlmError) {
    tracing::error!(
        provider = %pair.provider,
        model = %pair.model,
        error = %error,
        "streaming branch failed"
    );
    let _ = tx
        .send(CompareEvent::BranchError {
            provider: pair.provider,
            model: pair.model.clone(),
            message: error.public_message(),
        })
        .await;
}
