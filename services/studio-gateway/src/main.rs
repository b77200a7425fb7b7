//! Studio Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads an API key pool (user keys from a JSON file, system keys from env)
//! 2. Exposes story, image, speech, lyrics, UGC and video generation over HTTP
//! 3. Rotates across keys so a rejected or rate-limited key never fails a
//!    request while another key still works
//! 4. Lets the user manage their own keys at /keys

mod api;
mod config;
mod error;
mod keys;
mod metrics;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use genai::{GenAiClient, Studio};
use key_pool::{KeyPool, KeyStore, Rotator};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::api::{ApiState, build_api_router};
use crate::config::Config;
use crate::keys::{KeysState, build_keys_router};
use crate::metrics::ServiceMetrics;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    studio: Arc<Studio>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit caps simultaneous requests at `max_connections`;
/// the body limit bounds inline images.
fn build_router(state: AppState, max_connections: usize, max_body_bytes: usize) -> Router {
    let api = build_api_router(ApiState {
        studio: state.studio.clone(),
        metrics: state.metrics.clone(),
    });
    let keys = build_keys_router(KeysState {
        pool: state.studio.pool().clone(),
    });

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(api)
        .merge(keys)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// Open the key store and wire pool, rotation, client and adapters together.
async fn build_state(config: &Config, prometheus: PrometheusHandle) -> error::Result<AppState> {
    let store = match &config.keys.user_keys_file {
        Some(path) => KeyStore::load(path.clone())
            .await
            .map_err(|source| error::Error::KeyStore {
                path: path.clone(),
                source,
            })?,
        None => {
            warn!("no user_keys_file configured, saved keys will not survive a restart");
            KeyStore::ephemeral()
        }
    };

    let pool = Arc::new(KeyPool::new(store, config.system_key_list()).await);
    if pool.total().await == 0 {
        warn!("no API keys configured; generation fails until keys are added at /keys");
    }

    let client = GenAiClient::new(
        &config.upstream.base_url,
        Duration::from_secs(config.upstream.timeout_secs),
    )?;
    let studio = Studio::new(
        Rotator::new(pool, config.classifier()),
        client,
        config.studio_settings(),
    );

    Ok(AppState {
        studio: Arc::new(studio),
        metrics: ServiceMetrics::new(),
        prometheus,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting studio-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()
        .map_err(|e| error::Error::Metrics(e.to_string()))?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        system_keys = config.system_key_list().len(),
        "configuration loaded"
    );

    let app_state = build_state(&config, prometheus_handle).await?;
    let in_flight = app_state.metrics.in_flight.clone();
    let app = build_router(
        app_state,
        config.server.max_connections,
        config.server.max_body_bytes,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|source| error::Error::Bind {
            addr: listen_addr,
            source,
        })?;

    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to drain, then the drain races DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: key pool summary plus uptime and request counters.
/// Returns 503 only when no key is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.studio.pool().health().await;
    let status_code = if body["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    body["uptime_seconds"] = state.metrics.started_at.elapsed().as_secs().into();
    body["requests_served"] = state.metrics.requests_total.load(Ordering::Relaxed).into();
    body["errors_total"] = state.metrics.errors_total.load(Ordering::Relaxed).into();
    body["in_flight"] = state.metrics.in_flight.load(Ordering::Relaxed).into();

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: renders all recorded metrics in text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.prometheus.render();
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

/// Wait for SIGINT or SIGTERM. A handler that cannot be installed is logged
/// and never fires, so the other signal still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
