// src/server/mod.rs
//
// HTTP surface: router construction and the listener loop.

pub mod response;
pub mod routes;

use crate::config::ProxyConfig;
use crate::service::ImageService;
use anyhow::Context;
use axum::http::Request;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, Span};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImageService>,
    pub config: Arc<ProxyConfig>,
}

impl AppState {
    pub fn new(service: ImageService, config: ProxyConfig) -> Self {
        Self {
            service: Arc::new(service),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::query_route))
        .route("/healthz", get(routes::healthz))
        .route("/a/{bucket}/{*file}", get(routes::bucket_small))
        .route("/b/{bucket}/{*file}", get(routes::bucket_large))
        .route("/c/{*url}", get(routes::external_small))
        .route("/d/{*url}", get(routes::external_large))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        method = %request.method(),
                        route = %request.uri().path(),
                        status_code = tracing::field::Empty,
                        latency_ms = tracing::field::Empty
                    )
                })
                .on_request(|_request: &Request<_>, _span: &Span| {})
                .on_response(
                    |response: &axum::response::Response, latency: Duration, span: &Span| {
                        span.record("status_code", response.status().as_u16());
                        span.record("latency_ms", latency.as_millis() as u64);
                    },
                ),
        )
        .with_state(state)
}

/// Bind on all interfaces at the configured port and serve until ctrl-c.
///
/// # Errors
///
/// Fails if the fetch client cannot be built or the port cannot be bound.
pub async fn serve(config: ProxyConfig) -> anyhow::Result<()> {
    let service = ImageService::from_config(&config).context("failed to build image service")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(service, config));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "pixbox listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
