//! llmselect HTTP server.
//!
//! Builds the shared [`AppState`], mounts the API routes and runs axum with
//! graceful shutdown.

use crate::config::AppConfig;
use crate::keys::StoredKeyResolver;
use crate::routes;
use crate::store::Store;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use ls_llm::{CredentialResolver, FanOutCoordinator, InvocationClient, Invoker};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: AppConfig,
    pub store: Store,
    pub invoker: Arc<dyn Invoker>,
    pub coordinator: FanOutCoordinator,
}

impl AppState {
    pub fn new(config: AppConfig, store: Store, invoker: Arc<dyn Invoker>) -> Self {
        let coordinator = FanOutCoordinator::new(invoker.clone());
        Self {
            config,
            store,
            invoker,
            coordinator,
        }
    }

    /// Credential resolver scoped to one request's user.
    pub fn resolver_for(&self, user_id: &str) -> Arc<dyn CredentialResolver> {
        Arc::new(StoredKeyResolver::new(
            self.store.clone(),
            self.config.fallback_keys(),
            user_id.to_string(),
        ))
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = AppConfig::load_with_path(config_path).await?;
    let fallback_providers: Vec<String> = cfg
        .fallback_keys()
        .into_keys()
        .map(|p| p.to_string())
        .collect();
    tracing::info!(
        bind_addr = %cfg.server.bind_addr,
        db_path = %cfg.server.db_path,
        llm_max_tokens = cfg.llm.max_tokens,
        gateway_enabled = cfg.gateway.enabled,
        gateway_deployments = cfg.gateway.deployments.len(),
        fallback_key_providers = ?fallback_providers,
        config_path = %path.display(),
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = AppConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr();
    tracing::info!(
        bind_addr = %addr,
        db_path = %cfg.server.db_path,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        llm_max_tokens = cfg.llm.max_tokens,
        gateway_enabled = cfg.gateway.enabled,
        config_path = %cfg_path.display(),
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store = Store::open(std::path::Path::new(&cfg.server.db_path))?;
    let invoker: Arc<dyn Invoker> = Arc::new(InvocationClient::with_gateway(cfg.gateway_config()));
    let state = Arc::new(AppState::new(cfg.clone(), store, invoker));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "llmselect serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");
    shutdown.cancel();

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
