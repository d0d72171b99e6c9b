//! Relay server binary.
//!
//! Starts the axum HTTP server with structured logging and graceful shutdown
//! on SIGTERM/SIGINT.

use relay_hub::{Backend, Hub, HubConfig, NoBackend};
use relay_server::backend_http::HttpBackend;
use relay_server::{app, config, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("RELAY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let hub = Hub::new(HubConfig {
        replay_capacity: config.stream.replay_capacity,
        client_queue_capacity: config.stream.client_queue_capacity,
    });

    let backend: Arc<dyn Backend> = match config.backend.url.as_deref() {
        Some(url) => {
            let backend = HttpBackend::new(url, config.backend.timeout())
                .expect("failed to build backend HTTP client");
            tracing::info!(url = backend.base_url(), "using HTTP backend");
            Arc::new(backend)
        }
        None => {
            tracing::warn!("no backend configured; backend operations will report unavailable");
            Arc::new(NoBackend)
        }
    };

    let state = AppState::new(hub.clone(), backend, &config);
    tracing::info!(
        heartbeat_secs = state.heartbeat.as_secs(),
        rate_limit_rps = config.rate_limit.requests_per_second,
        replay_capacity = config.stream.replay_capacity,
        "relay state initialized"
    );

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");
    tracing::info!(%addr, "relay server listening");

    let grace = config.server.shutdown_grace();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Streams end once the hub's shutdown signal fires, letting the
            // server's connection drain complete.
            hub.shutdown(grace).await;
        })
        .await
        .expect("server error");

    tracing::info!("relay server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
