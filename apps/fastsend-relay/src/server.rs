use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::actor::RelayHandle;
use crate::config::ServerConfig;
use crate::counter::TransferCounter;
use crate::relay::RelayState;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub counter: TransferCounter,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/connect", get(websocket_handler))
        .route("/api/count", get(count_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on an already bound listener until the future is dropped
/// or the listener fails.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("server exited with error")
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let counter = TransferCounter::load(&config.count_file).await?;
    info!(
        count = counter.get(),
        path = %config.count_file.display(),
        "transfer count loaded"
    );

    let relay_state = RelayState::new(config.relay.clone()).with_counter(counter.clone());
    let (relay, relay_task) = RelayHandle::spawn(relay_state, config.sweep_interval);
    let state = AppState {
        relay,
        counter,
        metrics,
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("fastsend-relay listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    relay_task.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn count_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "count": state.counter.get() }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.relay.stats().await {
        Some(stats) => Json(stats).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
