//! WeRelay server.
//!
//! Wires the Gemini client, the WeChat adapter, the picture cache and the coalescer
//! into shared state, then mounts the webhook and health routes.

use crate::coalescer::{Coalescer, PendingStore};
use crate::config::WeRelayConfig;
use crate::picture_cache::PictureCache;
use crate::relay::RelayService;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::response::Response;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use wr_channels::{ChannelAdapter, OutboundMessage, WeChatAdapter};
use wr_llm::GeminiClient;

pub struct RelayState {
    /// Shared secret for webhook signature checks.
    pub token: String,
    pub coalescer: Arc<Coalescer>,
    pub pictures: Arc<PictureCache>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = WeRelayConfig::load_with_path(config_path).await?;
    let gemini = cfg.gemini_config();
    tracing::info!(
        config_path = %path.display(),
        bind_addr = %cfg.bind_addr()?,
        wechat_api_base_url = %cfg.wechat.api_base_url,
        wechat_credentials_configured = cfg.wechat_credentials().is_some(),
        gemini_pro_url = %gemini.pro_url,
        gemini_pro_vision_url = %gemini.pro_vision_url,
        gemini_max_attempts = gemini.retry.max_attempts(),
        relay_reply_window_ms = cfg.relay.reply_window_ms,
        relay_final_retry = cfg.relay.final_retry,
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(config_path: Option<PathBuf>, recipient: &str, message: &str) -> Result<()> {
    let cfg = WeRelayConfig::load(config_path).await?;
    let credentials = cfg.wechat_credentials().ok_or_else(|| {
        anyhow::anyhow!("send requires wechat.app_id and wechat.app_secret (or WECHAT_APP_ID / WECHAT_APP_SECRET)")
    })?;
    let adapter = WeChatAdapter::new(&cfg.wechat.api_base_url)?.with_credentials(Some(credentials));
    adapter
        .send(
            recipient,
            OutboundMessage {
                content: message.to_string(),
            },
        )
        .await?;
    tracing::info!(recipient = %recipient, "message sent");
    Ok(())
}

/// Build the shared relay state from a validated config.
pub fn build_state(cfg: &WeRelayConfig, wechat: WeChatAdapter) -> Arc<RelayState> {
    let pictures = Arc::new(PictureCache::new(cfg.picture_expiry()));
    let relay = Arc::new(RelayService::new(
        GeminiClient::new(cfg.gemini_config()),
        wechat,
        pictures.clone(),
    ));
    let coalescer = Arc::new(Coalescer::new(
        Arc::new(PendingStore::new()),
        relay,
        cfg.coalescer_config(),
    ));
    Arc::new(RelayState {
        token: cfg.wechat.token.trim().to_string(),
        coalescer,
        pictures,
    })
}

pub fn build_router(state: Arc<RelayState>, cfg: &WeRelayConfig) -> axum::Router {
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

    routes::router(cfg.http_timeout())
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = WeRelayConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        wechat_api_base_url = %cfg.wechat.api_base_url,
        wechat_credentials_configured = cfg.wechat_credentials().is_some(),
        gemini_max_attempts = cfg.gemini.max_attempts,
        gemini_request_timeout_seconds = cfg.gemini.request_timeout_seconds,
        relay_reply_window_ms = cfg.relay.reply_window_ms,
        relay_final_retry = cfg.relay.final_retry,
        relay_pending_expiry_seconds = cfg.relay.pending_expiry_seconds,
        relay_picture_expiry_seconds = cfg.relay.picture_expiry_seconds,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let wechat =
        WeChatAdapter::new(&cfg.wechat.api_base_url)?.with_credentials(cfg.wechat_credentials());
    let shutdown = CancellationToken::new();
    wechat.start(shutdown.child_token()).await?;

    let state = build_state(&cfg, wechat);
    let app = build_router(state.clone(), &cfg);

    tracing::info!(%addr, "werelay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    let pending = state.coalescer.store();
    if !pending.is_empty() || !state.pictures.is_empty() {
        tracing::warn!(
            pending = pending.len(),
            pictures = state.pictures.len(),
            "shutting down with in-flight generations or unconsumed pictures"
        );
    }
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
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
