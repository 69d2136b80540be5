//! # Session gateway
//!
//! Runs the Axum HTTP server for one API instance. The HTTP surface is
//! deliberately small: health and metrics probes, object downloads, and
//! the two-step socket handshake (`/ws-connect` then `/ws`). Everything
//! else travels over the socket as tagged binary frames dispatched by
//! [`handlers`].

pub(crate) mod auth;
mod download;
mod handlers;
mod ws;

use crate::quant::QuantContext;
use crate::sessions::SessionRegistry;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct AppState {
    pub ctx: QuantContext,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(ctx: QuantContext) -> Arc<Self> {
        let sessions = Arc::clone(ctx.notifier.sessions());
        Arc::new(AppState { ctx, sessions })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws-connect", get(ws::handler_ws_connect))
        .route("/ws", get(ws::handler_ws))
        .route(
            "/{resource}/download/{*path}",
            get(download::handler_download),
        )
        .route("/healthz", get(handler_healthz))
        .route("/readyz", get(handler_readyz))
        .route("/metrics", get(handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Liveness probe: if the binary is serving HTTP, it is alive.
async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: `SELECT 1` against the store with a 2-second cap.
/// 503 tells the load balancer to stop routing here until it passes.
async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check =
        tokio::time::timeout(Duration::from_secs(2), state.ctx.db.health_check()).await;
    match check {
        Ok(Ok(())) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }
}

async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.ctx.metrics.encode();
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
}

/// Background loop refreshing the operational gauges every 15 seconds.
pub fn spawn_metrics_refresh(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            state
                .ctx
                .metrics
                .ws_sessions
                .set(state.sessions.session_count() as i64);
            state
                .ctx
                .metrics
                .active_jobs
                .set(state.ctx.tracker.active_count() as i64);
            state
                .ctx
                .metrics
                .cache_resident_bytes
                .set(state.ctx.cache.resident_bytes() as i64);
        }
    });
}

pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    spawn_metrics_refresh(Arc::clone(&state));
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "api instance running");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("api instance shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! { _ = ctrl_c => info!("received SIGINT, shutting down"), _ = sigterm.recv() => info!("received SIGTERM, shutting down") }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
