//! Relay server library logic.

pub mod api_message;
pub mod api_sse;
pub mod backend_http;
pub mod config;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Extension, Json, Router,
};
use config::Config;
use middleware::RateLimiter;
use relay_hub::{Backend, Hub};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Event hub: replay log, connected clients, shutdown signal.
    pub hub: Hub,
    /// Backend automation service.
    pub backend: Arc<dyn Backend>,
    /// Rate limiter state.
    pub rate_limiter: RateLimiter,
    /// Paths that bypass the rate limiter.
    pub exempt_paths: Vec<String>,
    /// `Access-Control-Allow-Origin` value for preflight responses.
    pub cors_origin: HeaderValue,
    /// Idle keep-alive interval for event streams.
    pub heartbeat: Duration,
    /// Maximum event stream lifetime; `None` keeps streams open indefinitely.
    pub stream_deadline: Option<Duration>,
    /// Upper bound on a `/message` exchange.
    pub request_timeout: Duration,
}

impl AppState {
    /// Builds the state from loaded configuration.
    pub fn new(hub: Hub, backend: Arc<dyn Backend>, config: &Config) -> Self {
        let cors_origin = HeaderValue::from_str(&config.cors.allowed_origin).unwrap_or_else(|_| {
            tracing::warn!(
                origin = %config.cors.allowed_origin,
                "invalid CORS origin, falling back to \"*\""
            );
            HeaderValue::from_static("*")
        });

        Self {
            hub,
            backend,
            rate_limiter: RateLimiter::new(config.rate_limit.requests_per_second),
            exempt_paths: config.rate_limit.exempt_paths.clone(),
            cors_origin,
            heartbeat: config.stream.heartbeat(),
            stream_deadline: config.server.write_timeout(),
            request_timeout: config.server.read_timeout(),
        }
    }
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Metrics handler: hub counters plus rate limiter state.
async fn metrics(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let mut body = serde_json::to_value(state.hub.stats()).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut body {
        map.insert(
            "rate_limit_enabled".to_string(),
            json!(state.rate_limiter.is_enabled()),
        );
        map.insert(
            "rate_limit_tokens".to_string(),
            json!(state.rate_limiter.tokens()),
        );
    }
    Json(body)
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    // The timeout applies to request/response exchanges only; event streams
    // are long-lived and bounded by their own deadline.
    let message = Router::new()
        .route("/message", post(api_message::message_handler))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.request_timeout,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events", get(api_sse::events_handler))
        .merge(message)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::rate_limit_middleware))
        .layer(axum::middleware::from_fn(middleware::cors_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
