use axum::{
    body::Body,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::AppState;

/// Source of the current time for the token bucket.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall-clock time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Used to drive the bucket deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilling at `rate` tokens per second up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Creates a full bucket with `burst = max(1, 2 * rate)`.
    fn new(rate: f64, clock: Arc<dyn Clock>) -> Self {
        let burst = (2.0 * rate).max(1.0);
        let now = clock.now();
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: now,
            }),
            clock,
        }
    }

    fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        if state.tokens < 1.0 {
            return false;
        }
        state.tokens -= 1.0;
        true
    }

    fn tokens(&self) -> f64 {
        self.lock_state().tokens
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // Lock poisoned by a panicked thread. The bucket state is two
                // plain numbers, so the poisoned guard is still usable.
                tracing::error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }
}

/// Process-wide admission control.
///
/// `Disabled` admits everything, so call sites never need to check whether
/// limiting is configured.
#[derive(Debug, Clone)]
pub enum RateLimiter {
    Disabled,
    Enabled(Arc<TokenBucket>),
}

impl RateLimiter {
    /// Creates a limiter for `rate` requests per second. `rate <= 0` disables limiting.
    pub fn new(rate: f64) -> Self {
        Self::with_clock(rate, Arc::new(SystemClock))
    }

    pub fn with_clock(rate: f64, clock: Arc<dyn Clock>) -> Self {
        if rate.is_nan() || rate <= 0.0 {
            return Self::Disabled;
        }
        Self::Enabled(Arc::new(TokenBucket::new(rate, clock)))
    }

    /// Consumes one token if available. Never blocks.
    pub fn allow(&self) -> bool {
        match self {
            Self::Disabled => true,
            Self::Enabled(bucket) => bucket.allow(),
        }
    }

    /// Tokens currently in the bucket, or `-1.0` when disabled.
    pub fn tokens(&self) -> f64 {
        match self {
            Self::Disabled => -1.0,
            Self::Enabled(bucket) => bucket.tokens(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::Disabled
    }
}

/// Rate limiting middleware.
///
/// Exempt paths (health and metrics by default) always pass. Rejected
/// requests get `429 Too Many Requests` with `Retry-After: 1` and never reach
/// the router.
pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let path = req.uri().path();
    if state.exempt_paths.iter().any(|p| p == path) {
        return Ok(next.run(req).await);
    }

    if !state.rate_limiter.allow() {
        tracing::debug!(path, method = %req.method(), "request rejected by rate limiter");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        return Ok(response);
    }

    Ok(next.run(req).await)
}

/// CORS middleware.
///
/// Answers every `OPTIONS` request with `204 No Content` and the configured
/// allowed origin. Other requests are passed through untouched.
pub async fn cors_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    if req.method() != Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, state.cors_origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Last-Event-ID"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    Ok(response)
}
